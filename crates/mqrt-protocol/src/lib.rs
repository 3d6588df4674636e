// mqrt-protocol: Wire-level vocabulary for the mqrt runtime.
//
// Everything that crosses the broker as MQTT user-property text lives here:
// the reserved property names, the protocol version format, the stream-frame
// header codec, and the application error codes carried in `AppErrCode`.
//
// This crate is deliberately free of any MQTT client or runtime types so it
// can be depended on by both the runtime and the test utilities.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Reserved user-property names
// ---------------------------------------------------------------------------

/// Names beginning with this prefix are owned by the protocol.
///
/// User-supplied metadata must never use it; unknown inbound names with this
/// prefix are logged and withheld from user callbacks.
pub const RESERVED_PREFIX: &str = "__";

/// Sender identity: the MQTT client id of the sender (telemetry) or the
/// invoker (RPC requests) or the executor (RPC responses).
pub const PROP_SOURCE_ID: &str = "__srcId";

/// Superseded name for [`PROP_SOURCE_ID`]; read as a fallback, never written.
pub const PROP_INVOKER_ID: &str = "__invId";

/// Hybrid logical clock stamp, formatted `ts:counter:nodeId`.
pub const PROP_TIMESTAMP: &str = "__ts";

/// Protocol version, formatted `major.minor`.  Assumed `0.1` when absent.
pub const PROP_PROTOCOL_VERSION: &str = "__protVer";

/// Stream frame header, see [`StreamFrame`].
pub const PROP_STREAM: &str = "__stream";

/// Application error code on an error response.  One of [`codes`].
pub const PROP_APP_ERR_CODE: &str = "AppErrCode";

/// JSON-encoded detail object accompanying `AppErrCode`.
pub const PROP_APP_ERR_PAYLOAD: &str = "AppErrPayload";

/// True when `name` belongs to the protocol-owned namespace.
pub fn is_reserved_name(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX)
}

/// True when `name` is a reserved name this runtime understands.
pub fn is_known_reserved_name(name: &str) -> bool {
    matches!(
        name,
        PROP_SOURCE_ID | PROP_INVOKER_ID | PROP_TIMESTAMP | PROP_PROTOCOL_VERSION | PROP_STREAM
    )
}

// ---------------------------------------------------------------------------
// Protocol versions
// ---------------------------------------------------------------------------

/// A `major.minor` protocol version.
///
/// Telemetry, RPC and streamed RPC each carry their own monotonic version;
/// a major bump signals a breaking over-the-wire change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

/// Version assumed when `__protVer` is absent from an inbound message.
pub const DEFAULT_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 0, minor: 1 };

/// Current version written on telemetry messages.
pub const TELEMETRY_VERSION: ProtocolVersion = ProtocolVersion { major: 0, minor: 1 };

/// Current version written on classical RPC requests and responses.
pub const RPC_VERSION: ProtocolVersion = ProtocolVersion { major: 0, minor: 1 };

/// Current version written on streamed RPC frames.  A distinct namespace from
/// classical RPC even while the numbers coincide.
pub const STREAM_VERSION: ProtocolVersion = ProtocolVersion { major: 0, minor: 1 };

/// Major versions each receiving side understands.
pub const SUPPORTED_TELEMETRY_MAJORS: &[u16] = &[0];
pub const SUPPORTED_RPC_MAJORS: &[u16] = &[0];
pub const SUPPORTED_STREAM_MAJORS: &[u16] = &[0];

impl ProtocolVersion {
    /// True when `self`'s major version appears in `supported`.
    pub fn is_supported(&self, supported: &[u16]) -> bool {
        supported.contains(&self.major)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Failure to parse a wire-level header value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireParseError {
    #[error("malformed protocol version: {0:?}")]
    Version(String),
    #[error("malformed stream frame header: {0:?}")]
    StreamFrame(String),
}

impl FromStr for ProtocolVersion {
    type Err = WireParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| WireParseError::Version(s.to_owned()))?;
        let major = major
            .parse::<u16>()
            .map_err(|_| WireParseError::Version(s.to_owned()))?;
        let minor = minor
            .parse::<u16>()
            .map_err(|_| WireParseError::Version(s.to_owned()))?;
        Ok(ProtocolVersion { major, minor })
    }
}

// ---------------------------------------------------------------------------
// Stream frame header
// ---------------------------------------------------------------------------

/// Metadata carried in the `__stream` user property, one per frame.
///
/// Wire form is colon-separated decimal fields, booleans as `0`/`1`:
///
/// ```text
/// <index>:<is_last>:<cancel>            response frames
/// <index>:<is_last>:<cancel>:<timeout>  request frames (timeout in ms)
/// ```
///
/// The timeout is repeated on every request frame so losing earlier frames
/// does not cost the executor the deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFrame {
    /// Sender-assigned position, starting at 0.  Receivers deliver in receipt
    /// order and do not reorder by index.
    pub index: u64,
    /// Final frame of this direction of the stream.
    pub is_last: bool,
    /// Cancellation marker; a cancel frame is `(0, true, true)` with a zero
    /// timeout and no payload.
    pub cancel: bool,
    /// Invoker-chosen stream deadline in milliseconds; request frames only.
    pub timeout_ms: Option<u64>,
}

impl StreamFrame {
    /// A data-bearing request frame.
    pub fn request(index: u64, timeout_ms: u64) -> Self {
        StreamFrame { index, is_last: false, cancel: false, timeout_ms: Some(timeout_ms) }
    }

    /// The empty terminator frame closing a request stream.
    pub fn request_terminator(index: u64, timeout_ms: u64) -> Self {
        StreamFrame { index, is_last: true, cancel: false, timeout_ms: Some(timeout_ms) }
    }

    /// A response frame.
    pub fn response(index: u64, is_last: bool) -> Self {
        StreamFrame { index, is_last, cancel: false, timeout_ms: None }
    }

    /// The cancel frame, identical in both directions.
    pub fn cancellation() -> Self {
        StreamFrame { index: 0, is_last: true, cancel: true, timeout_ms: Some(0) }
    }

    /// Encode to the `__stream` property value.
    pub fn encode(&self) -> String {
        match self.timeout_ms {
            Some(t) => format!(
                "{}:{}:{}:{}",
                self.index,
                u8::from(self.is_last),
                u8::from(self.cancel),
                t
            ),
            None => {
                format!("{}:{}:{}", self.index, u8::from(self.is_last), u8::from(self.cancel))
            }
        }
    }
}

impl fmt::Display for StreamFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn parse_wire_bool(s: &str, raw: &str) -> Result<bool, WireParseError> {
    match s {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(WireParseError::StreamFrame(raw.to_owned())),
    }
}

impl FromStr for StreamFrame {
    type Err = WireParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(':').collect();
        if fields.len() != 3 && fields.len() != 4 {
            return Err(WireParseError::StreamFrame(s.to_owned()));
        }
        let index = fields[0]
            .parse::<u64>()
            .map_err(|_| WireParseError::StreamFrame(s.to_owned()))?;
        let is_last = parse_wire_bool(fields[1], s)?;
        let cancel = parse_wire_bool(fields[2], s)?;
        let timeout_ms = match fields.get(3) {
            Some(t) => {
                Some(t.parse::<u64>().map_err(|_| WireParseError::StreamFrame(s.to_owned()))?)
            }
            None => None,
        };
        Ok(StreamFrame { index, is_last, cancel, timeout_ms })
    }
}

// ---------------------------------------------------------------------------
// Application error codes
// ---------------------------------------------------------------------------

/// Frozen error codes carried in the `AppErrCode` user property.
pub mod codes {
    pub const TIMEOUT: &str = "Timeout";
    pub const CANCELLED: &str = "Cancelled";
    pub const UNSUPPORTED_VERSION: &str = "UnsupportedVersion";
    pub const HEADER_MISSING: &str = "HeaderMissing";
    pub const HEADER_INVALID: &str = "HeaderInvalid";
    pub const PAYLOAD_INVALID: &str = "PayloadInvalid";
    pub const STATE_INVALID: &str = "StateInvalid";
    pub const EXECUTOR_ERROR: &str = "ExecutorError";
}

/// Detail object carried JSON-encoded in `AppErrPayload`.
///
/// All fields optional; senders include what they know.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppErrorDetail {
    /// Human-readable description of the failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// On `UnsupportedVersion`: major versions the responder understands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_major_versions: Option<Vec<u16>>,
    /// On `HeaderMissing` / `HeaderInvalid`: the offending property name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_name: Option<String>,
}

impl AppErrorDetail {
    /// Detail with just a message.
    pub fn message(message: impl Into<String>) -> Self {
        AppErrorDetail { message: Some(message.into()), ..AppErrorDetail::default() }
    }

    /// Encode to the `AppErrPayload` property value.
    pub fn encode(&self) -> String {
        // Serializing a struct of optional strings cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode an `AppErrPayload` property value; `None` when malformed.
    pub fn decode(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}
