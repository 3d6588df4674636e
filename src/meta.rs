//! Mapping between user-visible metadata and MQTT user properties.
//!
//! Outbound: envoys describe what they want on the wire and the marshaller
//! emits the ordered property list, refusing user data that trespasses on the
//! reserved namespace.  Inbound: the property list is split into protocol
//! fields and user data; unknown reserved names are logged and withheld.

use crate::error::{Error, ErrorKind, Result};
use crate::hlc::HybridLogicalClock;
use mqrt_protocol::{
    AppErrorDetail, DEFAULT_PROTOCOL_VERSION, PROP_APP_ERR_CODE, PROP_APP_ERR_PAYLOAD,
    PROP_INVOKER_ID, PROP_PROTOCOL_VERSION, PROP_SOURCE_ID, PROP_STREAM, PROP_TIMESTAMP,
    ProtocolVersion, StreamFrame, is_reserved_name,
};
use tracing::warn;

/// Everything an envoy wants marshalled onto an outbound publish.
pub(crate) struct OutboundMeta<'a> {
    pub source_id: &'a str,
    pub timestamp: Option<&'a HybridLogicalClock>,
    pub version: ProtocolVersion,
    pub stream: Option<StreamFrame>,
    pub app_error: Option<(&'static str, AppErrorDetail)>,
    pub user_data: &'a [(String, String)],
}

impl OutboundMeta<'_> {
    /// Build the ordered user-property list.  Protocol properties come first,
    /// user data after, in caller order.
    pub fn into_properties(self) -> Result<Vec<(String, String)>> {
        let mut props = Vec::with_capacity(self.user_data.len() + 4);
        props.push((PROP_SOURCE_ID.to_owned(), self.source_id.to_owned()));
        props.push((PROP_PROTOCOL_VERSION.to_owned(), self.version.to_string()));
        if let Some(ts) = self.timestamp {
            props.push((PROP_TIMESTAMP.to_owned(), ts.to_string()));
        }
        if let Some(frame) = self.stream {
            props.push((PROP_STREAM.to_owned(), frame.encode()));
        }
        if let Some((code, detail)) = self.app_error {
            props.push((PROP_APP_ERR_CODE.to_owned(), code.to_owned()));
            props.push((PROP_APP_ERR_PAYLOAD.to_owned(), detail.encode()));
        }
        for (name, value) in self.user_data {
            if is_reserved_name(name)
                || name == PROP_APP_ERR_CODE
                || name == PROP_APP_ERR_PAYLOAD
            {
                return Err(Error::shallow(
                    ErrorKind::ArgumentInvalid,
                    format!("user property name {name:?} is protocol-reserved"),
                )
                .with_property(name.clone()));
            }
            props.push((name.clone(), value.clone()));
        }
        Ok(props)
    }
}

/// A failure reported by the remote side via `AppErrCode`.
#[derive(Debug, Clone)]
pub(crate) struct RemoteFailure {
    pub code: String,
    pub detail: Option<AppErrorDetail>,
}

impl RemoteFailure {
    /// Rehydrate into a typed error with `is_remote` set.
    pub fn into_error(self) -> Error {
        let message = self
            .detail
            .as_ref()
            .and_then(|d| d.message.clone())
            .unwrap_or_else(|| format!("remote failure {}", self.code));
        let kind = ErrorKind::from_app_code(&self.code).unwrap_or(ErrorKind::ExecutorError);
        let mut err = Error::new(kind, message).remote();
        if kind == ErrorKind::ExecutorError {
            err = err.in_application();
        }
        if let Some(name) = self.detail.and_then(|d| d.property_name) {
            err = err.with_property(name);
        }
        err
    }
}

/// Protocol fields and user data recovered from an inbound property list.
#[derive(Debug)]
pub(crate) struct InboundMeta {
    pub source_id: Option<String>,
    pub timestamp: Option<HybridLogicalClock>,
    pub version: ProtocolVersion,
    pub stream: Option<StreamFrame>,
    pub failure: Option<RemoteFailure>,
    pub user_data: Vec<(String, String)>,
}

impl InboundMeta {
    /// Split an inbound property list.
    ///
    /// Malformed protocol properties are `HeaderInvalid` errors; unknown
    /// names in the reserved namespace are logged and dropped, never
    /// surfaced as user data.
    pub fn parse(properties: &[(String, String)]) -> Result<InboundMeta> {
        let mut meta = InboundMeta {
            source_id: None,
            timestamp: None,
            version: DEFAULT_PROTOCOL_VERSION,
            stream: None,
            failure: None,
            user_data: Vec::new(),
        };
        let mut fallback_source = None;
        let mut error_code = None;
        let mut error_detail = None;

        for (name, value) in properties {
            match name.as_str() {
                PROP_SOURCE_ID => meta.source_id = Some(value.clone()),
                PROP_INVOKER_ID => fallback_source = Some(value.clone()),
                PROP_TIMESTAMP => meta.timestamp = Some(value.parse()?),
                PROP_PROTOCOL_VERSION => {
                    meta.version = value.parse().map_err(|_| {
                        Error::new(
                            ErrorKind::HeaderInvalid,
                            format!("malformed protocol version {value:?}"),
                        )
                        .with_property(PROP_PROTOCOL_VERSION)
                    })?;
                }
                PROP_STREAM => {
                    meta.stream = Some(value.parse().map_err(|_| {
                        Error::new(
                            ErrorKind::HeaderInvalid,
                            format!("malformed stream frame header {value:?}"),
                        )
                        .with_property(PROP_STREAM)
                    })?);
                }
                PROP_APP_ERR_CODE => error_code = Some(value.clone()),
                PROP_APP_ERR_PAYLOAD => {
                    error_detail = AppErrorDetail::decode(value);
                    if error_detail.is_none() {
                        warn!(value, "discarding malformed error detail property");
                    }
                }
                other if is_reserved_name(other) => {
                    warn!(name = other, "ignoring unknown reserved user property");
                }
                _ => meta.user_data.push((name.clone(), value.clone())),
            }
        }

        if meta.source_id.is_none() {
            meta.source_id = fallback_source;
        }
        if let Some(code) = error_code {
            meta.failure = Some(RemoteFailure { code, detail: error_detail });
        }
        Ok(meta)
    }

    /// `UnsupportedVersion` check against a supported-majors list.
    pub fn require_version(&self, supported: &[u16]) -> Result<()> {
        if self.version.is_supported(supported) {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::UnsupportedVersion,
                format!("protocol version {} not supported", self.version),
            )
            .with_property(PROP_PROTOCOL_VERSION))
        }
    }
}
