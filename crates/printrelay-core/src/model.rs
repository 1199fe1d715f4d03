// ── Stable downstream models ──
//
// What consumers see after `decode` has absorbed firmware drift.
// Snapshots are derived fresh from each inbound message, last write wins;
// nothing here is persisted.

use chrono::{DateTime, Utc};

// ── Camera ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraStatus {
    Online,
    Offline,
}

/// Normalized camera state for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraState {
    pub running: bool,
    /// WebRTC play URL when one is advertised. Never an HLS (`.m3u8`)
    /// URL -- those are filtered out during decoding.
    pub webrtc_url: Option<String>,
    /// `Online` iff `running`.
    pub status: CameraStatus,
}

impl Default for CameraState {
    fn default() -> Self {
        Self {
            running: false,
            webrtc_url: None,
            status: CameraStatus::Offline,
        }
    }
}

// ── Printer dashboard ───────────────────────────────────────────────

/// Status flags, normalized. Authoritative over any free-text state
/// string the firmware sends alongside them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrinterFlags {
    pub operational: bool,
    pub printing: bool,
    pub paused: bool,
    pub ready: bool,
    pub error: bool,
}

impl PrinterFlags {
    /// A controller is considered connected when any flag is set.
    pub fn any(&self) -> bool {
        self.operational || self.printing || self.paused || self.ready || self.error
    }
}

/// Normalized dashboard snapshot for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrinterStatus {
    pub connected: bool,
    /// Normalized state string; `"offline"` when disconnected,
    /// `"operational"` whenever the ready flag is set.
    pub state: String,
    pub flags: PrinterFlags,
}

impl Default for PrinterStatus {
    fn default() -> Self {
        Self {
            connected: false,
            state: "offline".into(),
            flags: PrinterFlags::default(),
        }
    }
}

// ── Upload progress ─────────────────────────────────────────────────

/// One progress observation for an upload in flight.
///
/// Immutable and ephemeral: delivered to zero or more observers,
/// never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    /// Correlation id the report refers to, when the firmware includes one.
    pub job_id: Option<String>,
    pub stage: Option<String>,
    pub name: Option<String>,
    pub received_bytes: u64,
    pub total_bytes: u64,
    pub percent: f64,
    pub timestamp: DateTime<Utc>,
}

// ── Terminal outcomes ───────────────────────────────────────────────

/// How a correlated wait ended.
///
/// `TimedOut` is an outcome, not an error: the wait completed with a
/// known negative answer and its subscription has been released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultOutcome {
    /// Control-style result, `ok: true`.
    Accepted { message: Option<String> },
    /// Control-style result, `ok: false`.
    Rejected { message: Option<String> },
    /// Upload result, `success: true`.
    Completed {
        filename: Option<String>,
        target: Option<String>,
        file_size: Option<u64>,
    },
    /// Upload result, `success: false`.
    Failed { error: Option<String> },
    /// No matching terminal envelope arrived before the deadline.
    TimedOut,
}

impl ResultOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Accepted { .. } | Self::Completed { .. })
    }
}
