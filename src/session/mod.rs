//! Session: the protocol state machine layered on top of a [`Transport`]
//! (§4.4). Owns registration, heartbeat, request/response matching, delta
//! merge, and continuity tracking behind a single actor task — the
//! "reader" task of §5 — so the in-flight table and the snapshot each have
//! exactly one writer, per the concurrency model.

mod actor;

use crate::error::{ConnectError, Result};
use crate::identity::Identity;
use crate::model::{ResponseEnvelope, StatusSnapshot};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

pub const DEFAULT_INVOKE_DEADLINE: Duration = Duration::from_secs(5);
pub const REGISTER_TIMEOUT: Duration = Duration::from_secs(3);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(65);
pub const DEGRADED_GRACE: Duration = Duration::from_secs(20);

/// Protocol state machine, §3: `IDLE → DISCOVERING → CONNECTING →
/// REGISTERING → READY → DEGRADED → CLOSED`, with `RECONNECTING` reachable
/// from any non-terminal state on transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Discovering,
    Connecting,
    Registering,
    Ready,
    Degraded,
    Reconnecting,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

/// Per-device options a [`Session`] needs beyond [`Identity`]: an access
/// code for CC2 registration, and (legacy dialect only) the host port the
/// embedded broker should bind.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub access_code: Option<String>,
    pub legacy_broker_port: Option<u16>,
}

enum ActorCommand {
    Invoke {
        request_id: u64,
        method: i64,
        params: Value,
        reply: oneshot::Sender<Result<ResponseEnvelope>>,
    },
    /// Drops an in-flight entry whose caller gave up waiting, so a late
    /// response is discarded instead of resolving a dead oneshot (§5).
    Forget {
        request_id: u64,
    },
    Close,
}

/// A live connection to one printer. Cheap to clone: clones share the same
/// background actor and channels.
#[derive(Clone)]
pub struct Session {
    identity: Identity,
    command_tx: mpsc::Sender<ActorCommand>,
    state_rx: watch::Receiver<SessionState>,
    snapshot_rx: watch::Receiver<StatusSnapshot>,
    request_id_counter: Arc<AtomicU64>,
}

impl Session {
    /// Opens a session for `identity`. Blocks until the transport's first
    /// bytes are exchanged (and, for CC2, registration completes) or
    /// returns an error — never silently falls back to background retry
    /// for the *initial* connect, per §4.3's `Open()` contract. Background
    /// reconnection after that point is the actor's job.
    pub async fn open(identity: Identity, options: SessionOptions) -> Result<Self> {
        if identity.is_cloud_only() {
            return Err(ConnectError::UnsupportedMode);
        }

        let (command_tx, command_rx) = mpsc::channel(32);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (snapshot_tx, snapshot_rx) = watch::channel(StatusSnapshot::default());
        let request_id_counter = Arc::new(AtomicU64::new(1));

        let ready_rx = actor::spawn(
            identity.clone(),
            options,
            command_rx,
            state_tx,
            snapshot_tx,
            Arc::clone(&request_id_counter),
        );

        // Wait for the actor's first connect (+ registration, if CC2) to
        // settle before returning, matching §4.3's blocking Open() contract.
        ready_rx
            .await
            .map_err(|_| ConnectError::TransportReset("session actor exited during open".into()))??;

        Ok(Self {
            identity,
            command_tx,
            state_rx,
            snapshot_rx,
            request_id_counter,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// A copy of the current full status tree, per §4.5's `Snapshot()`.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// A change stream with latest-wins semantics and no back-pressure
    /// build-up (a `watch` channel drops intermediate values by design).
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Sends a command and awaits its matching response, or `RequestTimeout`
    /// if `deadline` elapses first (default 5 s, §4.4). On timeout the
    /// in-flight entry is dropped so a late response is discarded rather
    /// than silently resolved (§5).
    pub async fn invoke(
        &self,
        method: i64,
        params: Value,
        deadline: Option<Duration>,
    ) -> Result<ResponseEnvelope> {
        let request_id = self.request_id_counter.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(ActorCommand::Invoke {
                request_id,
                method,
                params,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ConnectError::SessionClosed)?;

        match tokio::time::timeout(deadline.unwrap_or(DEFAULT_INVOKE_DEADLINE), reply_rx).await {
            Ok(inner) => inner.map_err(|_| ConnectError::SessionClosed)?,
            Err(_) => {
                let _ = self
                    .command_tx
                    .send(ActorCommand::Forget { request_id })
                    .await;
                Err(ConnectError::RequestTimeout)
            }
        }
    }

    /// Idempotent. Cancels all outstanding invokes with `SessionClosed` and
    /// stops the actor's tasks.
    pub async fn close(&self) {
        let _ = self.command_tx.send(ActorCommand::Close).await;
    }
}
