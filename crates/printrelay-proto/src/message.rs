//! Wire payload types, one closed tagged union per topic family.
//!
//! Outbound shapes serialize exactly what the controller firmware expects;
//! inbound shapes are deliberately loose (`#[serde(default)]`, flattened
//! `extra`) because firmware versions drift. Anything unrecognized decodes
//! to an explicit `Unknown` so listeners can log and drop instead of dying.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Serialize an outbound payload.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(value).map_err(|e| Error::Encode {
        message: e.to_string(),
    })
}

// ── Control topic ────────────────────────────────────────────────────

/// Relative vs absolute positioning for a move command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveMode {
    Relative,
    Absolute,
}

/// Payloads on `control/{device}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Home {
        axes: Vec<String>,
    },
    Pause,
    Resume,
    Cancel,
    Move {
        mode: MoveMode,
        #[serde(skip_serializing_if = "Option::is_none")]
        dx: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        dy: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        dz: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        de: Option<f64>,
        feedrate: f64,
    },
    SetTemperature {
        tool: String,
        value: f64,
        #[serde(default)]
        wait: bool,
    },
    SetFeedRate {
        percent: u32,
    },
}

// ── G-code ingest topic ──────────────────────────────────────────────

/// Payloads on `gcode/{device}`.
///
/// `start`/`chunk`/`end` carry the chunked transfer; `cancel` tells the
/// receiver to discard partial state for the job; `print` asks the
/// controller to start printing an already-transferred file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum IngestMessage {
    Start {
        job_id: String,
        filename: String,
        total_chunks: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        upload_target: Option<String>,
    },
    Chunk {
        job_id: String,
        seq: u64,
        data_b64: String,
    },
    End {
        job_id: String,
        target: String,
    },
    Cancel {
        job_id: String,
    },
    Print {
        filename: String,
        origin: String,
        job_id: String,
    },
}

// ── Result topic ─────────────────────────────────────────────────────

/// Body of an `sd_upload_progress` report.
///
/// Every field is optional on the wire; older firmware omits `name` and
/// sends `percent` as an integer.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UploadProgress {
    #[serde(default)]
    pub upload_id: Option<String>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub received_bytes: u64,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub percent: f64,
}

/// Parsed message from a result topic.
///
/// `Progress` never terminates a wait; the two result variants do.
/// `Unknown` is valid JSON whose discriminator we do not recognize —
/// routed nowhere, logged by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultMessage {
    Progress {
        progress: UploadProgress,
        /// Epoch seconds as reported by the controller, when present.
        timestamp: Option<f64>,
    },
    ControlResult {
        action: String,
        ok: bool,
        message: Option<String>,
    },
    UploadResult {
        job_id: String,
        success: bool,
        filename: Option<String>,
        target: Option<String>,
        file_size: Option<u64>,
        error: Option<String>,
    },
    Unknown,
}

impl ResultMessage {
    /// Parse a raw result-topic payload.
    ///
    /// The inner `message` of a progress report arrives either as a JSON
    /// string or as an already-parsed object depending on firmware
    /// version; both are accepted here.
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        let value: Value = serde_json::from_slice(payload).map_err(|e| Error::Parse {
            message: format!("result payload is not JSON: {e}"),
        })?;

        if value.get("action").and_then(Value::as_str) == Some("sd_upload_progress") {
            return Self::parse_progress(&value);
        }

        match value.get("type").and_then(Value::as_str) {
            Some("control_result") => Ok(Self::ControlResult {
                action: value
                    .get("action")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                ok: value.get("ok").and_then(Value::as_bool).unwrap_or(false),
                message: value
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
            }),
            Some("upload_result") => {
                let job_id = value
                    .get("job_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Parse {
                        message: "upload_result without job_id".into(),
                    })?
                    .to_owned();
                Ok(Self::UploadResult {
                    job_id,
                    success: value
                        .get("success")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                    filename: value
                        .get("filename")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                    target: value
                        .get("target")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                    file_size: value.get("file_size").and_then(Value::as_u64),
                    error: value
                        .get("error")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                })
            }
            _ => Ok(Self::Unknown),
        }
    }

    fn parse_progress(value: &Value) -> Result<Self, Error> {
        let body = match value.get("message") {
            // Newer firmware: already-parsed object.
            Some(obj @ Value::Object(_)) => {
                serde_json::from_value(obj.clone()).map_err(|e| Error::Parse {
                    message: format!("bad progress body: {e}"),
                })?
            }
            // Older firmware: JSON doubly encoded as a string.
            Some(Value::String(s)) => serde_json::from_str(s).map_err(|e| Error::Parse {
                message: format!("bad progress body string: {e}"),
            })?,
            _ => UploadProgress::default(),
        };
        Ok(Self::Progress {
            progress: body,
            timestamp: value.get("timestamp").and_then(Value::as_f64),
        })
    }
}

// ── Camera topics ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraAction {
    Start,
    Stop,
}

/// Payload on `camera/{device}/cmd`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraCommandMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub action: CameraAction,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub options: Value,
}

impl CameraCommandMessage {
    pub fn start(options: Value) -> Self {
        Self {
            kind: "camera".into(),
            action: CameraAction::Start,
            options,
        }
    }

    pub fn stop() -> Self {
        Self {
            kind: "camera".into(),
            action: CameraAction::Stop,
            options: Value::Null,
        }
    }
}

/// Raw payload on `camera/{device}/state`. Normalization (URL fallback
/// chain, HLS exclusion) lives in printrelay-core.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CameraStateRaw {
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub webrtc: Option<CameraWebrtcRaw>,
    #[serde(default)]
    pub play_url_webrtc: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(flatten)]
    pub extra: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CameraWebrtcRaw {
    #[serde(default)]
    pub play_url_webrtc: Option<String>,
}

// ── Dashboard status ─────────────────────────────────────────────────

/// Status flag block as reported by the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct PrinterFlagsRaw {
    #[serde(default)]
    pub operational: bool,
    #[serde(default)]
    pub printing: bool,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub error: bool,
}

/// Raw dashboard payload.
///
/// `state` drifts across firmware: either a plain string or an object
/// `{text, flags}`. `flags` may appear at the top level or nested inside
/// `state`. printrelay-core resolves both layouts.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DashboardStateRaw {
    #[serde(default)]
    pub state: Value,
    #[serde(default)]
    pub flags: Option<PrinterFlagsRaw>,
    #[serde(flatten)]
    pub extra: Value,
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn control_message_wire_shape() {
        let encoded = serde_json::to_value(&ControlMessage::Home {
            axes: vec!["x".into(), "y".into()],
        })
        .unwrap();
        assert_eq!(encoded, json!({"type": "home", "axes": ["x", "y"]}));

        let encoded = serde_json::to_value(&ControlMessage::SetFeedRate { percent: 120 }).unwrap();
        assert_eq!(encoded, json!({"type": "set_feed_rate", "percent": 120}));
    }

    #[test]
    fn move_message_omits_absent_axes() {
        let encoded = serde_json::to_value(&ControlMessage::Move {
            mode: MoveMode::Relative,
            dx: Some(10.0),
            dy: None,
            dz: None,
            de: None,
            feedrate: 3000.0,
        })
        .unwrap();
        assert_eq!(
            encoded,
            json!({"type": "move", "mode": "relative", "dx": 10.0, "feedrate": 3000.0})
        );
    }

    #[test]
    fn ingest_chunk_wire_shape() {
        let encoded = serde_json::to_value(&IngestMessage::Chunk {
            job_id: "j1".into(),
            seq: 3,
            data_b64: "R0NPREU=".into(),
        })
        .unwrap();
        assert_eq!(
            encoded,
            json!({"action": "chunk", "job_id": "j1", "seq": 3, "data_b64": "R0NPREU="})
        );
    }

    #[test]
    fn parse_progress_with_string_body() {
        let inner = json!({
            "upload_id": "u-1",
            "stage": "writing",
            "name": "part.gcode",
            "received_bytes": 4096,
            "total_bytes": 8192,
            "percent": 50.0
        });
        let outer = json!({
            "action": "sd_upload_progress",
            "message": inner.to_string(),
            "timestamp": 1700000000.5
        });

        let parsed = ResultMessage::parse(outer.to_string().as_bytes()).unwrap();
        let ResultMessage::Progress {
            progress,
            timestamp,
        } = parsed
        else {
            panic!("expected progress, got {parsed:?}");
        };
        assert_eq!(progress.upload_id.as_deref(), Some("u-1"));
        assert_eq!(progress.received_bytes, 4096);
        assert_eq!(progress.percent, 50.0);
        assert_eq!(timestamp, Some(1700000000.5));
    }

    #[test]
    fn parse_progress_with_object_body() {
        let outer = json!({
            "action": "sd_upload_progress",
            "message": {
                "upload_id": "u-2",
                "stage": "streaming",
                "received_bytes": 100,
                "total_bytes": 400,
                "percent": 25
            }
        });

        let parsed = ResultMessage::parse(outer.to_string().as_bytes()).unwrap();
        let ResultMessage::Progress { progress, .. } = parsed else {
            panic!("expected progress");
        };
        assert_eq!(progress.upload_id.as_deref(), Some("u-2"));
        assert_eq!(progress.percent, 25.0);
    }

    #[test]
    fn parse_control_result() {
        let raw = json!({
            "type": "control_result",
            "action": "sd_upload",
            "ok": true,
            "message": "stored"
        });
        assert_eq!(
            ResultMessage::parse(raw.to_string().as_bytes()).unwrap(),
            ResultMessage::ControlResult {
                action: "sd_upload".into(),
                ok: true,
                message: Some("stored".into()),
            }
        );
    }

    #[test]
    fn parse_upload_result() {
        let raw = json!({
            "type": "upload_result",
            "job_id": "j-9",
            "success": false,
            "filename": "part.gcode",
            "timestamp": 1700000001,
            "error": "sd write failed"
        });
        assert_eq!(
            ResultMessage::parse(raw.to_string().as_bytes()).unwrap(),
            ResultMessage::UploadResult {
                job_id: "j-9".into(),
                success: false,
                filename: Some("part.gcode".into()),
                target: None,
                file_size: None,
                error: Some("sd write failed".into()),
            }
        );
    }

    #[test]
    fn unrecognized_discriminator_is_unknown() {
        let raw = json!({"type": "firmware_banner", "text": "hi"});
        assert_eq!(
            ResultMessage::parse(raw.to_string().as_bytes()).unwrap(),
            ResultMessage::Unknown
        );
    }

    #[test]
    fn non_json_payload_is_a_parse_error() {
        assert!(ResultMessage::parse(b"not json").is_err());
    }

    #[test]
    fn camera_command_wire_shape() {
        let encoded = serde_json::to_value(&CameraCommandMessage::start(json!({"fps": 15}))).unwrap();
        assert_eq!(
            encoded,
            json!({"type": "camera", "action": "start", "options": {"fps": 15}})
        );
        let encoded = serde_json::to_value(&CameraCommandMessage::stop()).unwrap();
        assert_eq!(encoded, json!({"type": "camera", "action": "stop"}));
    }

    #[test]
    fn camera_state_tolerates_partial_payloads() {
        let raw: CameraStateRaw = serde_json::from_value(json!({"running": true})).unwrap();
        assert!(raw.running);
        assert!(raw.url.is_none());

        let raw: CameraStateRaw = serde_json::from_value(json!({})).unwrap();
        assert!(!raw.running);
    }

    #[test]
    fn dashboard_state_tolerates_both_layouts() {
        let top: DashboardStateRaw = serde_json::from_value(json!({
            "state": "Printing",
            "flags": {"printing": true}
        }))
        .unwrap();
        assert_eq!(top.state, json!("Printing"));
        assert!(top.flags.is_some_and(|f| f.printing));

        let nested: DashboardStateRaw = serde_json::from_value(json!({
            "state": {"text": "Operational", "flags": {"operational": true}}
        }))
        .unwrap();
        assert!(nested.flags.is_none());
        assert_eq!(nested.state["text"], json!("Operational"));
    }
}
