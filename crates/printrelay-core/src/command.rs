// ── Command publishing ──
//
// Control intents are fire-and-forget: validate locally, encode, publish,
// done. No correlation id, no wait. QoS is chosen per operation --
// durable intents ride at-least-once, jog moves at-most-once because a
// stale jog arriving late is worse than a lost one.

use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use printrelay_proto::message::{self, CameraCommandMessage, ControlMessage, MoveMode};
use printrelay_proto::{DeviceId, QoS, TopicFamily, TopicRouter, Transport};

use crate::error::CoreError;

/// Feed-rate factor bounds, percent. Outside this range firmware behavior
/// is undefined, so values are rejected client-side, never clamped.
pub const FEED_RATE_MIN: u32 = 10;
pub const FEED_RATE_MAX: u32 = 500;

/// Printer axes addressable by `home` and `move`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
    E,
}

impl Axis {
    fn as_str(self) -> &'static str {
        match self {
            Self::X => "x",
            Self::Y => "y",
            Self::Z => "z",
            Self::E => "e",
        }
    }
}

/// A heater addressable by `set_temperature`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heater {
    /// Hotend by tool index (`tool0`, `tool1`, ...).
    Tool(u8),
    Bed,
    Chamber,
}

impl Heater {
    fn wire_name(self) -> String {
        match self {
            Self::Tool(n) => format!("tool{n}"),
            Self::Bed => "bed".into(),
            Self::Chamber => "chamber".into(),
        }
    }
}

/// A jog/move request. At least one axis delta should be set; the
/// feedrate is mm/min and must be positive.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveRequest {
    pub mode: MoveMode,
    pub dx: Option<f64>,
    pub dy: Option<f64>,
    pub dz: Option<f64>,
    pub de: Option<f64>,
    pub feedrate: f64,
}

/// All control intents understood by the controller firmware.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Home { axes: Vec<Axis> },
    Pause,
    Resume,
    Cancel,
    Move(MoveRequest),
    SetTemperature { heater: Heater, celsius: f64, wait: bool },
    SetFeedRate { percent: u32 },
}

impl ControlCommand {
    /// Short name for log fields. Payload values are deliberately not
    /// logged here; some carry URLs or tokens on forked firmware.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Home { .. } => "home",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
            Self::Move(_) => "move",
            Self::SetTemperature { .. } => "set_temperature",
            Self::SetFeedRate { .. } => "set_feed_rate",
        }
    }

    /// Per-operation delivery guarantee.
    pub fn qos(&self) -> QoS {
        match self {
            // High-frequency jogs: staleness is worse than loss.
            Self::Move(_) => QoS::AtMostOnce,
            _ => QoS::AtLeastOnce,
        }
    }

    fn validate(&self) -> Result<(), CoreError> {
        match self {
            Self::SetFeedRate { percent } => {
                if !(FEED_RATE_MIN..=FEED_RATE_MAX).contains(percent) {
                    return Err(CoreError::Validation {
                        message: format!(
                            "feed rate factor {percent}% outside [{FEED_RATE_MIN}, {FEED_RATE_MAX}]"
                        ),
                    });
                }
            }
            Self::SetTemperature { celsius, .. } => {
                if !celsius.is_finite() || *celsius < 0.0 {
                    return Err(CoreError::Validation {
                        message: format!("temperature {celsius} is not a valid target"),
                    });
                }
            }
            Self::Move(request) => {
                if !request.feedrate.is_finite() || request.feedrate <= 0.0 {
                    return Err(CoreError::Validation {
                        message: format!("feedrate {} must be positive", request.feedrate),
                    });
                }
            }
            Self::Home { .. } | Self::Pause | Self::Resume | Self::Cancel => {}
        }
        Ok(())
    }

    fn to_wire(&self) -> ControlMessage {
        match self {
            Self::Home { axes } => ControlMessage::Home {
                axes: axes.iter().map(|a| a.as_str().to_owned()).collect(),
            },
            Self::Pause => ControlMessage::Pause,
            Self::Resume => ControlMessage::Resume,
            Self::Cancel => ControlMessage::Cancel,
            Self::Move(r) => ControlMessage::Move {
                mode: r.mode,
                dx: r.dx,
                dy: r.dy,
                dz: r.dz,
                de: r.de,
                feedrate: r.feedrate,
            },
            Self::SetTemperature {
                heater,
                celsius,
                wait,
            } => ControlMessage::SetTemperature {
                tool: heater.wire_name(),
                value: *celsius,
                wait: *wait,
            },
            Self::SetFeedRate { percent } => ControlMessage::SetFeedRate { percent: *percent },
        }
    }
}

/// Publishes control and camera intents for devices behind the relay.
#[derive(Debug, Clone)]
pub struct CommandPublisher<T: Transport> {
    transport: Arc<T>,
    router: TopicRouter,
}

impl<T: Transport> CommandPublisher<T> {
    pub fn new(transport: Arc<T>, router: TopicRouter) -> Self {
        Self { transport, router }
    }

    /// Validate and publish a control intent. Transport failures
    /// propagate synchronously; there is no retry.
    pub async fn send(&self, device: &DeviceId, command: &ControlCommand) -> Result<(), CoreError> {
        command.validate()?;
        let topic = self.router.route(TopicFamily::Control, device);
        let payload = message::encode(&command.to_wire())?;
        debug!(
            device = %device.redacted(),
            command = command.name(),
            "publishing control command"
        );
        self.transport
            .publish(&topic, payload, command.qos(), false)
            .await?;
        Ok(())
    }

    /// Ask the device to start its camera pipeline.
    pub async fn camera_start(
        &self,
        device: &DeviceId,
        options: serde_json::Value,
    ) -> Result<(), CoreError> {
        self.send_camera(device, CameraCommandMessage::start(options))
            .await
    }

    /// Ask the device to stop its camera pipeline.
    pub async fn camera_stop(&self, device: &DeviceId) -> Result<(), CoreError> {
        self.send_camera(device, CameraCommandMessage::stop()).await
    }

    async fn send_camera(
        &self,
        device: &DeviceId,
        message_body: CameraCommandMessage,
    ) -> Result<(), CoreError> {
        let topic = self.router.route(TopicFamily::CameraCommand, device);
        let payload = message::encode(&message_body)?;
        debug!(device = %device.redacted(), action = ?message_body.action, "publishing camera command");
        self.transport
            .publish(&topic, payload, QoS::AtLeastOnce, false)
            .await?;
        Ok(())
    }

    /// Ask the device to publish a fresh dashboard report.
    pub async fn request_dashboard(&self, device: &DeviceId) -> Result<(), CoreError> {
        let topic = self.router.route(TopicFamily::DashboardQuery, device);
        let payload = message::encode(&json!({"type": "dashboard_query"}))?;
        debug!(device = %device.redacted(), "requesting dashboard report");
        self.transport
            .publish(&topic, payload, QoS::AtLeastOnce, false)
            .await?;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────
