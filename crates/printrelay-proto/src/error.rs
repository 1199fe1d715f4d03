use thiserror::Error;

/// Protocol-layer error type.
///
/// Covers identifier validation, broker transport failures, and payload
/// parse failures. `printrelay-core` maps these into its user-facing
/// taxonomy; consumers of this crate rarely match on them directly.
#[derive(Debug, Error)]
pub enum Error {
    // ── Identifiers ─────────────────────────────────────────────────
    /// Device identifier is not UUID-shaped. Rejected before any topic
    /// is composed, so a malformed id can never inject topic delimiters.
    #[error("Invalid device id (expected UUID shape)")]
    InvalidDeviceId,

    // ── Transport ───────────────────────────────────────────────────
    /// Broker connection could not be established.
    #[error("Broker connection failed: {reason}")]
    Connect { reason: String },

    /// A publish was rejected or the client request channel is gone.
    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    /// A subscribe request failed.
    #[error("Subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    /// An unsubscribe request failed.
    #[error("Unsubscribe from {topic} failed: {reason}")]
    Unsubscribe { topic: String, reason: String },

    /// The transport driver task has shut down.
    #[error("Transport closed")]
    TransportClosed,

    // ── Payloads ────────────────────────────────────────────────────
    /// A payload could not be serialized for publishing.
    #[error("Failed to encode payload: {message}")]
    Encode { message: String },

    /// An inbound payload on a subscribed topic was malformed.
    /// Callers log and drop — a bad message must never crash a listener
    /// or block later messages on the same topic.
    #[error("Malformed payload: {message}")]
    Parse { message: String },
}
