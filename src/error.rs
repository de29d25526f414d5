//! Typed error taxonomy for the connectivity core.
//!
//! Every error a caller can observe from [`crate::client::PrinterClient`],
//! [`crate::session::Session`], or [`crate::discovery`] maps to one of the
//! kinds below. Transport-layer failures are absorbed by the session and
//! surfaced only as [`ConnectError::TransportReset`] — callers never see a
//! raw socket error.

use std::time::Duration;

/// Retry delay mandated for `SlotExhausted` registration rejections.
pub const SLOT_EXHAUSTED_RETRY: Duration = Duration::from_secs(65);
/// Retry delay suggested for transient `PrinterBusy` responses.
pub const PRINTER_BUSY_RETRY: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq, Hash)]
pub enum ConnectError {
    #[error("no printers answered the discovery probe")]
    DiscoveryEmpty,

    #[error("printer is in cloud-only mode; LAN sessions are not supported")]
    UnsupportedMode,

    #[error("transport reset: {0}")]
    TransportReset(String),

    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    #[error("printer rejected registration: too many clients")]
    SlotExhausted,

    #[error("request timed out waiting for a response")]
    RequestTimeout,

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("printer is busy")]
    PrinterBusy,

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("unauthorized: bad access code")]
    UnauthorizedAccess,

    #[error("checksum mismatch during upload")]
    ChecksumMismatch,

    #[error("downstream consumer fell behind and was disconnected")]
    SlowConsumer,

    #[error("session is closed")]
    SessionClosed,
}

impl ConnectError {
    /// Application error codes (`errorCode` on `ResponseEnvelope`) that map to a specific kind.
    ///
    /// Any other nonzero code is surfaced as [`ConnectError::ProtocolError`] carrying the raw code.
    pub fn from_app_error_code(code: i64, context: &str) -> Self {
        match code {
            1000 => ConnectError::UnauthorizedAccess,
            1009 => ConnectError::PrinterBusy,
            1021 | 9007 => ConnectError::FileNotFound(context.to_string()),
            9004 => ConnectError::ChecksumMismatch,
            other => ConnectError::ProtocolError(format!("{context} (error_code={other})")),
        }
    }

    /// The mandated retry delay for kinds that specify one, or `None` if the
    /// caller must decide its own retry policy.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ConnectError::SlotExhausted => Some(SLOT_EXHAUSTED_RETRY),
            ConnectError::PrinterBusy => Some(PRINTER_BUSY_RETRY),
            _ => None,
        }
    }

    /// A short, stable identifier used as the key for the rate-limited
    /// warning log in [`crate::error::ErrorRateLimiter`].
    pub fn kind_tag(&self) -> &'static str {
        match self {
            ConnectError::DiscoveryEmpty => "discovery_empty",
            ConnectError::UnsupportedMode => "unsupported_mode",
            ConnectError::TransportReset(_) => "transport_reset",
            ConnectError::RegistrationFailed(_) => "registration_failed",
            ConnectError::SlotExhausted => "slot_exhausted",
            ConnectError::RequestTimeout => "request_timeout",
            ConnectError::ProtocolError(_) => "protocol_error",
            ConnectError::PrinterBusy => "printer_busy",
            ConnectError::FileNotFound(_) => "file_not_found",
            ConnectError::UnauthorizedAccess => "unauthorized_access",
            ConnectError::ChecksumMismatch => "checksum_mismatch",
            ConnectError::SlowConsumer => "slow_consumer",
            ConnectError::SessionClosed => "session_closed",
        }
    }
}

pub type Result<T> = std::result::Result<T, ConnectError>;

/// Rate-limits repeated WARN logs for the same error kind to at most once
/// per 60 seconds, per §7's propagation policy.
pub struct ErrorRateLimiter {
    last_logged: std::collections::HashMap<&'static str, std::time::Instant>,
    window: Duration,
}

impl Default for ErrorRateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl ErrorRateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            last_logged: std::collections::HashMap::new(),
            window,
        }
    }

    /// Returns `true` the first time a kind is seen, and at most once per
    /// `window` thereafter.
    pub fn should_log(&mut self, error: &ConnectError) -> bool {
        let tag = error.kind_tag();
        let now = std::time::Instant::now();
        match self.last_logged.get(tag) {
            Some(last) if now.duration_since(*last) < self.window => false,
            _ => {
                self.last_logged.insert(tag, now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_error_codes_map_to_known_kinds() {
        assert_eq!(
            ConnectError::from_app_error_code(1000, "x"),
            ConnectError::UnauthorizedAccess
        );
        assert_eq!(
            ConnectError::from_app_error_code(1009, "x"),
            ConnectError::PrinterBusy
        );
        assert_eq!(
            ConnectError::from_app_error_code(1021, "foo.gcode"),
            ConnectError::FileNotFound("foo.gcode".to_string())
        );
        assert_eq!(
            ConnectError::from_app_error_code(9007, "foo.gcode"),
            ConnectError::FileNotFound("foo.gcode".to_string())
        );
        assert_eq!(
            ConnectError::from_app_error_code(9004, "x"),
            ConnectError::ChecksumMismatch
        );
    }

    #[test]
    fn unknown_app_error_code_is_protocol_error() {
        assert!(matches!(
            ConnectError::from_app_error_code(4242, "ctx"),
            ConnectError::ProtocolError(_)
        ));
    }

    #[test]
    fn retry_after_matches_spec_delays() {
        assert_eq!(
            ConnectError::SlotExhausted.retry_after(),
            Some(SLOT_EXHAUSTED_RETRY)
        );
        assert_eq!(
            ConnectError::PrinterBusy.retry_after(),
            Some(PRINTER_BUSY_RETRY)
        );
        assert_eq!(ConnectError::RequestTimeout.retry_after(), None);
    }

    #[test]
    fn rate_limiter_suppresses_repeats_within_window() {
        let mut limiter = ErrorRateLimiter::new(Duration::from_secs(60));
        assert!(limiter.should_log(&ConnectError::RequestTimeout));
        assert!(!limiter.should_log(&ConnectError::RequestTimeout));
        // A different kind logs independently.
        assert!(limiter.should_log(&ConnectError::SlotExhausted));
    }
}
