// ── Core error types ──
//
// User-facing errors from printrelay-core. Consumers never see raw
// rumqttc failures; the `From<printrelay_proto::Error>` impl translates
// transport-layer errors into this taxonomy. Note the split the protocol
// depends on: `Transport` means "failed to send", a timed-out wait means
// "never heard back" and is reported as a `ResultOutcome`, not an error.

use std::time::Duration;

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Caller mistakes (fatal, never retried) ───────────────────────
    /// A parameter was out of range. Values are rejected, never clamped.
    #[error("Validation failed: {message}")]
    Validation { message: String },

    /// Device identifier is not UUID-shaped.
    #[error("Invalid device id")]
    InvalidDevice,

    /// The operation is not legal in the session's current state, e.g.
    /// a second concurrent wait registered for the same job id.
    #[error("Session state error: {message}")]
    SessionState { message: String },

    // ── Infrastructure ───────────────────────────────────────────────
    /// The broker client failed to send. Always propagated for
    /// state-changing publishes, never swallowed.
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    /// An in-process hand-off (publish acknowledgment, registry ack)
    /// did not complete in time. Distinct from a correlated result
    /// timing out, which resolves to `ResultOutcome::TimedOut`.
    #[error("Timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },

    /// The client or its dispatch task has shut down.
    #[error("Relay client is closed")]
    Closed,

    // ── Data ─────────────────────────────────────────────────────────
    /// A subscribed payload was malformed. Logged and dropped by
    /// listeners; surfaced only where a caller asked for a one-shot parse.
    #[error("Malformed payload: {message}")]
    Parse { message: String },

    // ── Internal ─────────────────────────────────────────────────────
    /// A local invariant was violated (e.g. a payload failed to
    /// serialize). This is a self-check, not a wire condition.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<printrelay_proto::Error> for CoreError {
    fn from(err: printrelay_proto::Error) -> Self {
        use printrelay_proto::Error as Proto;
        match err {
            Proto::InvalidDeviceId => CoreError::InvalidDevice,
            Proto::Connect { reason } => CoreError::Transport {
                reason: format!("connect: {reason}"),
            },
            Proto::Publish { topic, reason } => CoreError::Transport {
                reason: format!("publish to {topic}: {reason}"),
            },
            Proto::Subscribe { topic, reason } => CoreError::Transport {
                reason: format!("subscribe to {topic}: {reason}"),
            },
            Proto::Unsubscribe { topic, reason } => CoreError::Transport {
                reason: format!("unsubscribe from {topic}: {reason}"),
            },
            Proto::TransportClosed => CoreError::Closed,
            Proto::Encode { message } => CoreError::Internal(format!("encode: {message}")),
            Proto::Parse { message } => CoreError::Parse { message },
        }
    }
}
