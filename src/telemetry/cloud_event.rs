//! CloudEvents 1.0 mapping for telemetry messages.
//!
//! Context attributes ride as ordinary MQTT user properties (`specversion`,
//! `id`, `source`, `type`, `subject`, `dataschema`, `time`); the data content
//! type is the MQTT Content Type field itself.  Senders get defaults filled
//! in at publish time; receivers recover the event from the property list.

use crate::error::{Error, ErrorKind, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

pub const SPEC_VERSION: &str = "1.0";

/// Default `type` attribute stamped when the sender does not choose one.
pub const DEFAULT_EVENT_TYPE: &str = "mqrt.telemetry";

const ATTR_SPEC_VERSION: &str = "specversion";
const ATTR_ID: &str = "id";
const ATTR_SOURCE: &str = "source";
const ATTR_TYPE: &str = "type";
const ATTR_SUBJECT: &str = "subject";
const ATTR_DATA_SCHEMA: &str = "dataschema";
const ATTR_TIME: &str = "time";

/// A CloudEvents 1.0 context.
///
/// On send, `None` fields receive defaults: a fresh UUID `id`, the publish
/// topic as `subject`, the current instant as `time`.  `data_content_type`
/// reflects the MQTT Content Type field and is populated on receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudEvent {
    pub id: Option<String>,
    pub source: String,
    pub spec_version: String,
    pub event_type: String,
    pub subject: Option<String>,
    pub data_schema: Option<String>,
    pub data_content_type: Option<String>,
    pub time: Option<DateTime<Utc>>,
}

impl CloudEvent {
    /// Event context for `source`, with the default type and everything else
    /// defaulted at send time.
    pub fn new(source: impl Into<String>) -> Self {
        CloudEvent {
            id: None,
            source: source.into(),
            spec_version: SPEC_VERSION.to_owned(),
            event_type: DEFAULT_EVENT_TYPE.to_owned(),
            subject: None,
            data_schema: None,
            data_content_type: None,
            time: None,
        }
    }

    pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    /// Apply send-time defaults and emit the user-property pairs.
    ///
    /// `topic` becomes the default subject; the envelope's content type
    /// already carries `datacontenttype`.
    pub(crate) fn into_properties(self, topic: &str) -> Result<Vec<(String, String)>> {
        if self.source.is_empty() {
            return Err(Error::shallow(
                ErrorKind::ArgumentInvalid,
                "cloud event source is empty",
            ));
        }
        let id = self.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let time = self.time.unwrap_or_else(Utc::now);
        let subject = self.subject.unwrap_or_else(|| topic.to_owned());
        let mut props = vec![
            (ATTR_SPEC_VERSION.to_owned(), self.spec_version),
            (ATTR_ID.to_owned(), id),
            (ATTR_SOURCE.to_owned(), self.source),
            (ATTR_TYPE.to_owned(), self.event_type),
            (ATTR_SUBJECT.to_owned(), subject),
            (ATTR_TIME.to_owned(), time.to_rfc3339_opts(SecondsFormat::Millis, true)),
        ];
        if let Some(schema) = self.data_schema {
            props.push((ATTR_DATA_SCHEMA.to_owned(), schema));
        }
        Ok(props)
    }

    /// Recover a CloudEvent from an inbound message's user data and content
    /// type.
    ///
    /// Returns `Ok(None)` when the message carries no CloudEvent (no
    /// `specversion`), and `HeaderInvalid` when it carries a broken one.
    pub(crate) fn from_properties(
        user_data: &[(String, String)],
        content_type: Option<&str>,
    ) -> Result<Option<CloudEvent>> {
        let attr = |name: &str| {
            user_data
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
        };
        let Some(spec_version) = attr(ATTR_SPEC_VERSION) else {
            return Ok(None);
        };
        let malformed = |detail: &str, name: &str| {
            Error::new(ErrorKind::HeaderInvalid, format!("malformed cloud event: {detail}"))
                .with_property(name)
        };
        let id = attr(ATTR_ID).ok_or_else(|| malformed("missing id", ATTR_ID))?;
        let source = attr(ATTR_SOURCE).ok_or_else(|| malformed("missing source", ATTR_SOURCE))?;
        let event_type = attr(ATTR_TYPE).ok_or_else(|| malformed("missing type", ATTR_TYPE))?;
        let time = match attr(ATTR_TIME) {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(&raw)
                    .map_err(|_| malformed("bad rfc3339 time", ATTR_TIME))?
                    .with_timezone(&Utc),
            ),
            None => None,
        };
        Ok(Some(CloudEvent {
            id: Some(id),
            source,
            spec_version,
            event_type,
            subject: attr(ATTR_SUBJECT),
            data_schema: attr(ATTR_DATA_SCHEMA),
            data_content_type: content_type.map(str::to_owned),
            time,
        }))
    }
}
