//! Pluggable payload codecs.
//!
//! A codec declares a default content type and a payload-format indicator and
//! converts between a typed value and raw bytes.  The runtime ships a JSON
//! codec for serde types, a raw passthrough, and [`NoPayload`] for request- or
//! response-less operations.  Codec failures surface as `PayloadInvalid`.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// MQTT payload-format indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatIndicator {
    /// 0: unspecified bytes.
    #[default]
    UnspecifiedBytes,
    /// 1: UTF-8 text.
    Utf8Text,
}

impl FormatIndicator {
    pub fn as_u8(self) -> u8 {
        match self {
            FormatIndicator::UnspecifiedBytes => 0,
            FormatIndicator::Utf8Text => 1,
        }
    }
}

impl TryFrom<u8> for FormatIndicator {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(FormatIndicator::UnspecifiedBytes),
            1 => Ok(FormatIndicator::Utf8Text),
            other => Err(CodecError(format!("invalid payload format indicator {other}"))),
        }
    }
}

/// The wire form of a payload: bytes plus the content type and indicator to
/// set on the publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    pub bytes: Bytes,
    /// `None` leaves the MQTT Content Type field unset.
    pub content_type: Option<String>,
    pub format_indicator: FormatIndicator,
}

/// Codec failure; wrapped into a `PayloadInvalid` runtime error at the envoy
/// boundary.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct CodecError(pub String);

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        CodecError(e.to_string())
    }
}

/// A typed payload that knows how to cross the wire.
pub trait PayloadCodec: Sized + Send + 'static {
    /// Default content type stamped on outbound messages; `None` leaves the
    /// field unset.
    fn content_type() -> Option<&'static str>;

    /// Payload-format indicator stamped on outbound messages.
    fn format_indicator() -> FormatIndicator;

    fn encode(&self) -> Result<EncodedPayload, CodecError>;

    fn decode(
        bytes: &[u8],
        content_type: Option<&str>,
        format_indicator: FormatIndicator,
    ) -> Result<Self, CodecError>;
}

// ---------------------------------------------------------------------------
// NoPayload
// ---------------------------------------------------------------------------

/// The distinguished empty value for operations without a request or response
/// body.  Encodes to zero bytes with no content-type override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NoPayload;

impl PayloadCodec for NoPayload {
    fn content_type() -> Option<&'static str> {
        None
    }

    fn format_indicator() -> FormatIndicator {
        FormatIndicator::UnspecifiedBytes
    }

    fn encode(&self) -> Result<EncodedPayload, CodecError> {
        Ok(EncodedPayload {
            bytes: Bytes::new(),
            content_type: None,
            format_indicator: FormatIndicator::UnspecifiedBytes,
        })
    }

    fn decode(
        bytes: &[u8],
        _content_type: Option<&str>,
        _format_indicator: FormatIndicator,
    ) -> Result<Self, CodecError> {
        if bytes.is_empty() {
            Ok(NoPayload)
        } else {
            Err(CodecError(format!("expected empty payload, got {} bytes", bytes.len())))
        }
    }
}

// ---------------------------------------------------------------------------
// Json<T>
// ---------------------------------------------------------------------------

/// JSON codec over any serde type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Json<T>(pub T);

impl<T> PayloadCodec for Json<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn content_type() -> Option<&'static str> {
        Some("application/json")
    }

    fn format_indicator() -> FormatIndicator {
        FormatIndicator::Utf8Text
    }

    fn encode(&self) -> Result<EncodedPayload, CodecError> {
        Ok(EncodedPayload {
            bytes: Bytes::from(serde_json::to_vec(&self.0)?),
            content_type: Some("application/json".to_owned()),
            format_indicator: FormatIndicator::Utf8Text,
        })
    }

    fn decode(
        bytes: &[u8],
        content_type: Option<&str>,
        _format_indicator: FormatIndicator,
    ) -> Result<Self, CodecError> {
        if let Some(ct) = content_type {
            if ct != "application/json" {
                return Err(CodecError(format!("content type {ct:?} is not JSON")));
            }
        }
        Ok(Json(serde_json::from_slice(bytes)?))
    }
}

// ---------------------------------------------------------------------------
// RawPayload
// ---------------------------------------------------------------------------

/// Byte passthrough carrying its own content type and indicator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawPayload {
    pub bytes: Bytes,
    pub content_type: Option<String>,
    pub format_indicator: FormatIndicator,
}

impl PayloadCodec for RawPayload {
    fn content_type() -> Option<&'static str> {
        Some("application/octet-stream")
    }

    fn format_indicator() -> FormatIndicator {
        FormatIndicator::UnspecifiedBytes
    }

    fn encode(&self) -> Result<EncodedPayload, CodecError> {
        Ok(EncodedPayload {
            bytes: self.bytes.clone(),
            content_type: self
                .content_type
                .clone()
                .or_else(|| Self::content_type().map(str::to_owned)),
            format_indicator: self.format_indicator,
        })
    }

    fn decode(
        bytes: &[u8],
        content_type: Option<&str>,
        format_indicator: FormatIndicator,
    ) -> Result<Self, CodecError> {
        Ok(RawPayload {
            bytes: Bytes::copy_from_slice(bytes),
            content_type: content_type.map(str::to_owned),
            format_indicator,
        })
    }
}
