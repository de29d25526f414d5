//! Coordinator: periodic status polling wrapped around a [`Session`] (§4.7).
//!
//! Keeps the snapshot fresh for dialects whose inbound push isn't
//! comprehensive, and logs `DEGRADED`/`RECONNECTING`/`CLOSED` transitions.
//! Actual reconnect-with-backoff is handled inside the session's own actor
//! task (see [`crate::session::actor`]'s doc comment for why), so this task
//! only polls and observes state — it does not drive reconnection itself.

use crate::codec::method;
use crate::session::{Session, SessionState};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Default `GetStatus` poll cadence, overridable via
/// [`Coordinator::spawn_with_interval`] (and, at the config layer, by
/// `coordinator_poll_interval`).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct Coordinator {
    task: JoinHandle<()>,
}

impl Coordinator {
    pub fn spawn(session: Session) -> Self {
        Self::spawn_with_interval(session, DEFAULT_POLL_INTERVAL)
    }

    pub fn spawn_with_interval(session: Session, poll_interval: Duration) -> Self {
        let task = tokio::spawn(run(session, poll_interval));
        Self { task }
    }

    /// Idempotent. Stops the poll loop only; the underlying session is left
    /// open, since [`crate::client::PrinterClient::close`] owns that.
    pub fn stop(&self) {
        self.task.abort();
    }
}

async fn run(session: Session, poll_interval: Duration) {
    let mut tick = tokio::time::interval(poll_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Single flag shared with the spawned poll task below, so a tick that
    // fires while the previous GetStatus is still outstanding is skipped
    // rather than queued (§4.7's debounce rule).
    let outstanding = Arc::new(AtomicBool::new(false));
    let mut state_rx = session.watch_state();

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if outstanding.swap(true, Ordering::SeqCst) {
                    tracing::debug!("coordinator tick skipped, previous GetStatus still outstanding");
                    continue;
                }
                let session = session.clone();
                let outstanding = Arc::clone(&outstanding);
                tokio::spawn(async move {
                    if let Err(error) = session.invoke(method::GET_STATUS, json!({}), None).await {
                        tracing::debug!(%error, "coordinator poll failed");
                    }
                    outstanding.store(false, Ordering::SeqCst);
                });
            }

            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                match *state_rx.borrow() {
                    SessionState::Degraded => tracing::warn!("session degraded, heartbeat lapsed"),
                    SessionState::Reconnecting => tracing::warn!("session reconnecting"),
                    SessionState::Closed => {
                        tracing::info!("session closed, stopping coordinator");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}
