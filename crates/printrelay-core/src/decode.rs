// ── State decoding ──
//
// Total functions from raw payloads to the stable models in `model`.
// Upstream firmware drifts (renamed URL fields, flags nested one level
// deeper, free-text states that contradict flags); everything is absorbed
// here so consumers see one shape. Malformed input decodes to the
// offline default -- these functions do not fail.

use serde_json::Value;

use printrelay_proto::message::{CameraStateRaw, DashboardStateRaw, PrinterFlagsRaw};

use crate::model::{CameraState, CameraStatus, PrinterFlags, PrinterStatus};

// ── Camera ──────────────────────────────────────────────────────────

/// Normalize a raw camera-state payload.
pub fn decode_camera_state(payload: &[u8]) -> CameraState {
    let raw: CameraStateRaw = match serde_json::from_slice(payload) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::debug!(error = %e, "malformed camera state, defaulting to offline");
            return CameraState::default();
        }
    };
    camera_state_from_raw(&raw)
}

fn camera_state_from_raw(raw: &CameraStateRaw) -> CameraState {
    let status = if raw.running {
        CameraStatus::Online
    } else {
        CameraStatus::Offline
    };
    CameraState {
        running: raw.running,
        webrtc_url: pick_webrtc_url(raw),
        status,
    }
}

/// Ordered fallback across the field names older firmware used, skipping
/// anything that is empty or an HLS playlist. HLS URLs are a different
/// playback path entirely and must never be handed to a WebRTC player.
fn pick_webrtc_url(raw: &CameraStateRaw) -> Option<String> {
    let candidates = [
        raw.webrtc.as_ref().and_then(|w| w.play_url_webrtc.as_deref()),
        raw.play_url_webrtc.as_deref(),
        raw.url.as_deref(),
    ];
    candidates
        .into_iter()
        .flatten()
        .find(|url| !url.is_empty() && !is_hls(url))
        .map(str::to_owned)
}

fn is_hls(url: &str) -> bool {
    // Ignore query/fragment when checking the path extension.
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.ends_with(".m3u8")
}

// ── Printer dashboard ───────────────────────────────────────────────

/// Normalize a raw dashboard payload.
pub fn decode_printer_status(payload: &[u8]) -> PrinterStatus {
    let raw: DashboardStateRaw = match serde_json::from_slice(payload) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::debug!(error = %e, "malformed dashboard payload, defaulting to offline");
            return PrinterStatus::default();
        }
    };
    printer_status_from_raw(&raw)
}

/// Stream-side decode for the dashboard topic.
///
/// Queries and reports share one topic, and the broker delivers a
/// client's own query publish back to its matching subscription. A
/// query-shaped payload is dropped here so it never surfaces as a
/// phantom offline snapshot on the status stream.
pub fn decode_dashboard_report(payload: &[u8]) -> Option<PrinterStatus> {
    if is_dashboard_query(payload) {
        return None;
    }
    Some(decode_printer_status(payload))
}

fn is_dashboard_query(payload: &[u8]) -> bool {
    serde_json::from_slice::<Value>(payload)
        .is_ok_and(|v| v.get("type").and_then(Value::as_str) == Some("dashboard_query"))
}

fn printer_status_from_raw(raw: &DashboardStateRaw) -> PrinterStatus {
    let flags = resolve_flags(raw);
    let connected = flags.any();

    // Flags are authoritative over the embedded state string: `ready`
    // forces "operational" no matter what the text claims.
    let state = if flags.ready {
        "operational".to_owned()
    } else if !connected {
        "offline".to_owned()
    } else if let Some(text) = state_text(raw) {
        text
    } else {
        derive_state(&flags)
    };

    PrinterStatus {
        connected,
        state,
        flags,
    }
}

/// Flags appear at the top level on newer firmware and nested inside the
/// `state` object on older firmware.
fn resolve_flags(raw: &DashboardStateRaw) -> PrinterFlags {
    if let Some(flags) = raw.flags {
        return flags_from_raw(flags);
    }
    if let Some(nested) = raw.state.get("flags") {
        if let Ok(flags) = serde_json::from_value::<PrinterFlagsRaw>(nested.clone()) {
            return flags_from_raw(flags);
        }
    }
    PrinterFlags::default()
}

fn flags_from_raw(raw: PrinterFlagsRaw) -> PrinterFlags {
    PrinterFlags {
        operational: raw.operational,
        printing: raw.printing,
        paused: raw.paused,
        ready: raw.ready,
        error: raw.error,
    }
}

fn state_text(raw: &DashboardStateRaw) -> Option<String> {
    let text = match &raw.state {
        Value::String(s) => s.as_str(),
        Value::Object(map) => map.get("text").and_then(Value::as_str).unwrap_or(""),
        _ => "",
    };
    if text.is_empty() {
        None
    } else {
        Some(text.to_lowercase())
    }
}

fn derive_state(flags: &PrinterFlags) -> String {
    let state = if flags.error {
        "error"
    } else if flags.printing {
        "printing"
    } else if flags.paused {
        "paused"
    } else {
        "operational"
    };
    state.to_owned()
}

// ── Tests ────────────────────────────────────────────────────────────
