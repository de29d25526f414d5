//! Abstract bidirectional transport contract (§4.3) and its two concrete
//! implementations: [`websocket::WebSocketTransport`] and
//! [`mqtt::MqttTransport`] (host-broker and printer-broker modes).
//!
//! A transport's only job is moving opaque frames in and out with
//! reconnection; protocol semantics (registration, heartbeat, response
//! matching, delta merge) live one layer up in [`crate::session`].

pub mod mqtt;
pub mod websocket;

use rand::Rng;
use std::time::Duration;

/// A raw frame crossing the transport boundary. MQTT frames carry the topic
/// they arrived on / are destined for; WebSocket frames don't need one.
#[derive(Debug, Clone)]
pub enum Frame {
    Text(String),
    Publish { topic: String, payload: Vec<u8> },
}

/// Emitted by a transport's reader task as the connection's lifecycle
/// changes, in addition to inbound [`Frame`]s.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Inbound(Frame),
}

#[async_trait::async_trait]
pub trait Transport: Send {
    /// Blocks until the first bytes are exchanged (or the handshake
    /// otherwise completes) or returns an error.
    async fn open(&mut self) -> crate::error::Result<()>;

    /// Enqueues a frame for delivery; resolves once handed to the OS, not
    /// once any response is received.
    async fn send(&self, frame: Frame) -> crate::error::Result<()>;

    /// Idempotent; releases OS resources (sockets, embedded broker, etc).
    async fn close(&mut self);
}

/// Exponential backoff with jitter, per §5: `min(30s, 1s * 2^attempt) * (1 ± 0.2)`.
pub struct Backoff {
    attempt: u32,
}

const BACKOFF_CAP: Duration = Duration::from_secs(30);
const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// After this long in a stable connected state, the attempt counter resets.
pub const STABLE_RESET_AFTER: Duration = Duration::from_secs(60);

impl Default for Backoff {
    fn default() -> Self {
        Self { attempt: 0 }
    }
}

impl Backoff {
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Returns the delay to wait before the next attempt, then advances the
    /// internal attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = BACKOFF_BASE.saturating_mul(1 << self.attempt.min(5));
        let capped = exp.min(BACKOFF_CAP);
        self.attempt = self.attempt.saturating_add(1);
        jitter(capped)
    }
}

fn jitter(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let mut backoff = Backoff::default();
        let mut previous = Duration::ZERO;
        for _ in 0..10 {
            let delay = backoff.next_delay();
            assert!(delay <= BACKOFF_CAP.mul_f64(1.21));
            previous = delay;
        }
        let _ = previous;
    }

    #[test]
    fn backoff_resets_to_first_delay_range() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        let delay = backoff.next_delay();
        assert!(delay <= Duration::from_millis(1200));
    }
}
