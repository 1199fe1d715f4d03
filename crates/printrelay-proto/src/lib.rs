// printrelay-proto: MQTT relay protocol layer for printer controllers.
//
// Everything that knows about topic strings, wire payload shapes, and the
// broker connection lives here. printrelay-core builds sessions, waits,
// and state models on top of this crate.

pub mod device;
pub mod error;
pub mod loopback;
pub mod message;
pub mod mqtt;
pub mod topic;
pub mod transport;

pub use device::DeviceId;
pub use error::Error;
pub use message::{
    CameraAction, CameraCommandMessage, CameraStateRaw, ControlMessage, DashboardStateRaw,
    IngestMessage, MoveMode, PrinterFlagsRaw, ResultMessage, UploadProgress,
};
pub use mqtt::{MqttConfig, MqttCredentials, MqttTransport};
pub use topic::{TopicFamily, TopicRouter};
pub use transport::{InboundMessage, QoS, Transport};
