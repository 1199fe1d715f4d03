// printrelay-core: protocol orchestration on top of printrelay-proto.
//
// The relay broker gives us fire-and-forget topics and nothing else; this
// crate layers logical operations on top: validated control commands,
// chunked G-code upload sessions, await-style result correlation with
// timeouts, normalized device state, and reference-counted topic
// subscriptions shared by any number of listeners.

pub mod client;
pub mod command;
pub mod config;
pub mod correlate;
pub mod decode;
pub mod error;
pub mod model;
pub mod registry;
pub mod upload;

// ── Primary re-exports ──────────────────────────────────────────────
pub use client::{RelayClient, StateStream};
pub use command::{Axis, CommandPublisher, ControlCommand, Heater, MoveRequest};
pub use config::ClientConfig;
pub use correlate::{PendingWait, ResultChannel, ResultCorrelator, WaitSpec};
pub use error::CoreError;
pub use model::{
    CameraState, CameraStatus, PrinterFlags, PrinterStatus, ProgressEvent, ResultOutcome,
};
pub use registry::{ListenerRegistry, Subscription};
pub use upload::{UploadHandle, UploadManager, UploadReport, UploadRequest, UploadState, UploadTarget};

// Re-export the proto types that appear in this crate's public API.
pub use printrelay_proto::{DeviceId, InboundMessage, MoveMode, QoS, Transport};
