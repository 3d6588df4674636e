//! Error taxonomy shared by every envoy.
//!
//! All runtime failures collapse into a single [`Error`] carrying an
//! [`ErrorKind`] plus three informational booleans: `in_application` (wraps a
//! user handler failure), `is_shallow` (raised before any network I/O) and
//! `is_remote` (originated on the other side of the broker).  The booleans are
//! for diagnostics only; code must branch on the kind.

use mqrt_protocol::codes;
use std::fmt;

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Wrong MQTT version, invalid topic pattern, bad envoy construction.
    ConfigurationInvalid,
    /// Caller-supplied value violates a stated precondition.
    ArgumentInvalid,
    /// Serialization or deserialization failure.
    PayloadInvalid,
    /// Required user property absent.
    HeaderMissing,
    /// User property present but malformed.
    HeaderInvalid,
    /// Inbound `__protVer` not understood.
    UnsupportedVersion,
    /// Clock drift, cache corruption, or an internal invariant violation.
    StateInvalid,
    /// Invocation exceeded its deadline.
    Timeout,
    /// Cancellation by either party or the caller's token.
    Cancelled,
    /// MQTT session ended while operations were outstanding.
    ConnectionLost,
    /// User handler returned a failure.
    ExecutorError,
    /// Operation attempted on a disposed envoy.
    Disposed,
}

impl ErrorKind {
    /// Wire code for the kinds that travel in `AppErrCode`.
    pub fn as_app_code(self) -> Option<&'static str> {
        match self {
            ErrorKind::Timeout => Some(codes::TIMEOUT),
            ErrorKind::Cancelled => Some(codes::CANCELLED),
            ErrorKind::UnsupportedVersion => Some(codes::UNSUPPORTED_VERSION),
            ErrorKind::HeaderMissing => Some(codes::HEADER_MISSING),
            ErrorKind::HeaderInvalid => Some(codes::HEADER_INVALID),
            ErrorKind::PayloadInvalid => Some(codes::PAYLOAD_INVALID),
            ErrorKind::StateInvalid => Some(codes::STATE_INVALID),
            ErrorKind::ExecutorError => Some(codes::EXECUTOR_ERROR),
            _ => None,
        }
    }

    /// Inverse of [`ErrorKind::as_app_code`].
    pub fn from_app_code(code: &str) -> Option<ErrorKind> {
        match code {
            codes::TIMEOUT => Some(ErrorKind::Timeout),
            codes::CANCELLED => Some(ErrorKind::Cancelled),
            codes::UNSUPPORTED_VERSION => Some(ErrorKind::UnsupportedVersion),
            codes::HEADER_MISSING => Some(ErrorKind::HeaderMissing),
            codes::HEADER_INVALID => Some(ErrorKind::HeaderInvalid),
            codes::PAYLOAD_INVALID => Some(ErrorKind::PayloadInvalid),
            codes::STATE_INVALID => Some(ErrorKind::StateInvalid),
            codes::EXECUTOR_ERROR => Some(ErrorKind::ExecutorError),
            _ => None,
        }
    }
}

// Display writes the PascalCase name, which doubles as the wire code for the
// remotable subset.
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A runtime failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    /// True when this wraps a failure returned by a user handler.
    pub in_application: bool,
    /// True when raised before any network I/O happened.
    pub is_shallow: bool,
    /// True when the failure originated on the other side of the broker.
    pub is_remote: bool,
    /// Offending user-property name, for header errors.
    pub property_name: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
            in_application: false,
            is_shallow: false,
            is_remote: false,
            property_name: None,
        }
    }

    /// Shorthand for pre-network configuration and argument errors.
    pub fn shallow(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error { is_shallow: true, ..Error::new(kind, message) }
    }

    pub fn with_property(mut self, name: impl Into<String>) -> Self {
        self.property_name = Some(name.into());
        self
    }

    pub fn remote(mut self) -> Self {
        self.is_remote = true;
        self
    }

    pub fn in_application(mut self) -> Self {
        self.in_application = true;
        self
    }
}

/// Shared result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
