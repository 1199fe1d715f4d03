// ── Topic routing ──
//
// Pure mapping from (device, command family) to a topic string.
// No I/O, no failure modes beyond what DeviceId::parse already rejected:
// identical inputs always produce the identical topic, which is what makes
// subscribe/unsubscribe idempotent at the registry level.

use std::fmt;

use crate::device::DeviceId;

/// The command families the relay routes, one topic per (family, device).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicFamily {
    /// Control intents: home, pause, resume, cancel, move, temperatures.
    Control,
    /// Terminal results for control-family commands.
    ControlResult,
    /// Request for a fresh dashboard/status report.
    DashboardQuery,
    /// Chunked G-code transfer: start/chunk/end/cancel/print.
    GcodeIngest,
    /// Progress and terminal results for G-code transfers.
    GcodeResult,
    /// Camera start/stop commands.
    CameraCommand,
    /// Camera state reports (running flag, stream URLs).
    CameraState,
}

impl fmt::Display for TopicFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Control => "control",
            Self::ControlResult => "control-result",
            Self::DashboardQuery => "dashboard-query",
            Self::GcodeIngest => "gcode-ingest",
            Self::GcodeResult => "gcode-result",
            Self::CameraCommand => "camera-command",
            Self::CameraState => "camera-state",
        };
        f.write_str(name)
    }
}

/// Composes topic strings for a deployment.
///
/// `namespace` is an optional deployment-level prefix (multi-tenant
/// relays segment tenants this way); `None` yields the bare scheme.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicRouter {
    namespace: Option<String>,
}

impl TopicRouter {
    pub fn new(namespace: Option<String>) -> Self {
        Self { namespace }
    }

    /// Topic for one (family, device) pair.
    pub fn route(&self, family: TopicFamily, device: &DeviceId) -> String {
        let suffix = match family {
            TopicFamily::Control => format!("control/{device}"),
            TopicFamily::ControlResult => format!("control/{device}/result"),
            TopicFamily::DashboardQuery => format!("dashboard/{device}"),
            TopicFamily::GcodeIngest => format!("gcode/{device}"),
            TopicFamily::GcodeResult => format!("gcode/{device}/result"),
            TopicFamily::CameraCommand => format!("camera/{device}/cmd"),
            TopicFamily::CameraState => format!("camera/{device}/state"),
        };
        match &self.namespace {
            Some(ns) => format!("{ns}/{suffix}"),
            None => suffix,
        }
    }
}
