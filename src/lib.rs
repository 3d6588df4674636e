// mqrt: An application protocol runtime over MQTT v5.
//
// Three communication patterns on top of a standard broker: request/response
// RPC, one-way telemetry, and streamed RPC.  The runtime supplies the
// semantics raw publish/subscribe lacks: correlation, topic templating,
// hybrid-logical-clock ordering, executor-side request deduplication, and
// timeout/cancellation.  The MQTT client itself is consumed through
// `mqtt::MqttClient`; payload formats plug in through `payload::PayloadCodec`.

pub mod error;
pub mod hlc;
pub mod mqtt;
pub mod payload;
pub mod rpc;
pub mod telemetry;
pub mod topic;

mod meta;

/// Wire-level vocabulary shared with tooling and tests.
pub use mqrt_protocol as protocol;

pub use error::{Error, ErrorKind};
pub use hlc::{HybridLogicalClock, SharedClock};
pub use mqtt::{AckToken, ConnectionState, Envelope, InboundMessage, MqttClient, MqttError, QoS};
pub use payload::{
    CodecError, EncodedPayload, FormatIndicator, Json, NoPayload, PayloadCodec, RawPayload,
};
pub use rpc::{
    CommandExecutor, CommandExecutorOptions, CommandInvoker, CommandInvokerOptions, CommandReply,
    CommandRequest, CommandResponse, InvokeOptions,
};
pub use rpc::streaming::{
    ResponseStream, StreamExecutor, StreamExecutorOptions, StreamInvokeOptions, StreamInvoker,
    StreamInvokerOptions, StreamOutput, StreamRequest, StreamResponse,
};
pub use telemetry::{
    CloudEvent, SendOptions, TelemetryMessage, TelemetryReceiver, TelemetryReceiverOptions,
    TelemetrySender, TelemetrySenderOptions,
};
pub use topic::TopicPattern;
