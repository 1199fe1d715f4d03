// ── Device identity ──
//
// A controller is addressed by an opaque UUID handed out at pairing time.
// The UUID shape is enforced here, once, so everything downstream can
// compose topic strings without re-validating.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Identifier of one printer controller behind the relay.
///
/// Wraps a validated [`Uuid`]; construction via [`DeviceId::parse`] is the
/// only way to get one from untrusted input. Renders hyphenated lowercase,
/// which is also the form embedded in topic strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(Uuid);

impl DeviceId {
    /// Parse an untrusted string into a device id.
    ///
    /// Rejects anything that is not UUID-shaped with
    /// [`Error::InvalidDeviceId`] — this is the guard that keeps topic
    /// delimiters (`/`, `+`, `#`) out of composed topics.
    pub fn parse(value: &str) -> Result<Self, Error> {
        Uuid::parse_str(value)
            .map(Self)
            .map_err(|_| Error::InvalidDeviceId)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Redacted form for log output: only the first UUID segment.
    ///
    /// Device ids double as access tokens on some relay deployments, so
    /// they never appear whole in logs.
    pub fn redacted(&self) -> String {
        let full = self.0.to_string();
        let head = full.split('-').next().unwrap_or_default();
        format!("{head}-****")
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<Uuid> for DeviceId {
    fn from(u: Uuid) -> Self {
        Self(u)
    }
}
