//! One-way telemetry over MQTT v5.

pub mod cloud_event;
pub mod receiver;
pub mod sender;

pub use cloud_event::CloudEvent;
pub use receiver::{TelemetryMessage, TelemetryReceiver, TelemetryReceiverOptions};
pub use sender::{SendOptions, TelemetrySender, TelemetrySenderOptions};
