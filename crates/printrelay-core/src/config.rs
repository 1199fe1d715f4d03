// ── Runtime client configuration ──
//
// Built by the embedding application and handed to `RelayClient` --
// core never reads config files or the environment.

use std::time::Duration;

/// Tuning for one relay client session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Deployment-level topic prefix; `None` for the bare scheme.
    pub namespace: Option<String>,
    /// Default chunk size for uploads when the request does not set one.
    /// Chosen by this side; the receiver is never consulted.
    pub chunk_size: usize,
    /// Default timeout for a correlated result wait.
    pub result_timeout: Duration,
    /// Upper bound on a single publish acknowledgment. A hung broker
    /// queue fails the operation instead of wedging the session.
    pub publish_timeout: Duration,
    /// Capacity of each per-listener message channel. A listener that
    /// falls this far behind starts losing messages rather than
    /// blocking dispatch for everyone else.
    pub subscriber_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            chunk_size: 256 * 1024,
            result_timeout: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(10),
            subscriber_capacity: 64,
        }
    }
}
