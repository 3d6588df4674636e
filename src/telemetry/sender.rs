//! Telemetry sender envoy.
//!
//! One publish per call: resolve the topic, stamp the process clock into
//! `__ts`, optionally attach a CloudEvents context, and await the broker ack.
//! Telemetry never carries correlation data and never expects a response.

use crate::error::{Error, ErrorKind, Result};
use crate::hlc::SharedClock;
use crate::mqtt::{Envelope, MqttClient, QoS, require_mqtt_v5};
use crate::meta::OutboundMeta;
use crate::payload::PayloadCodec;
use crate::telemetry::cloud_event::CloudEvent;
use crate::topic::TopicPattern;
use mqrt_protocol::TELEMETRY_VERSION;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Construction-time configuration.
#[derive(Debug, Clone)]
pub struct TelemetrySenderOptions {
    /// Telemetry topic pattern.
    pub topic_pattern: String,
    /// Constant token bindings.
    pub topic_tokens: HashMap<String, String>,
    /// Message expiry applied when a send does not choose its own.
    pub default_message_expiry: Option<Duration>,
}

/// Per-send configuration.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub qos: QoS,
    /// Transient token bindings.
    pub topic_tokens: HashMap<String, String>,
    /// Caller metadata; reserved names are rejected.
    pub user_data: Vec<(String, String)>,
    pub message_expiry: Option<Duration>,
    /// CloudEvents context to attach; defaults filled at publish time.
    pub cloud_event: Option<CloudEvent>,
}

/// Telemetry sender envoy; see the module docs.
pub struct TelemetrySender<T> {
    client: Arc<dyn MqttClient>,
    clock: SharedClock,
    pattern: TopicPattern,
    default_message_expiry: Option<Duration>,
    _payload: PhantomData<fn(T)>,
}

impl<T> TelemetrySender<T>
where
    T: PayloadCodec,
{
    pub fn new(
        client: Arc<dyn MqttClient>,
        clock: SharedClock,
        options: TelemetrySenderOptions,
    ) -> Result<Self> {
        require_mqtt_v5(client.as_ref())?;
        let pattern = TopicPattern::new(&options.topic_pattern, options.topic_tokens)?;
        Ok(TelemetrySender {
            client,
            clock,
            pattern,
            default_message_expiry: options.default_message_expiry,
            _payload: PhantomData,
        })
    }

    /// Publish one telemetry message and await the broker acknowledgement.
    pub async fn send(&self, payload: T, options: SendOptions) -> Result<()> {
        let topic = self.pattern.publish_topic(&options.topic_tokens)?;
        let encoded = payload
            .encode()
            .map_err(|e| Error::shallow(ErrorKind::PayloadInvalid, e.to_string()))?;
        let stamp = self.clock.stamp()?;
        let mut user_properties = OutboundMeta {
            source_id: self.client.client_id(),
            timestamp: Some(&stamp),
            version: TELEMETRY_VERSION,
            stream: None,
            app_error: None,
            user_data: &options.user_data,
        }
        .into_properties()?;
        if let Some(cloud_event) = options.cloud_event {
            user_properties.extend(cloud_event.into_properties(&topic)?);
        }
        let envelope = Envelope {
            topic,
            payload: encoded.bytes,
            qos: options.qos,
            retain: false,
            content_type: encoded.content_type,
            format_indicator: encoded.format_indicator,
            correlation_data: None,
            response_topic: None,
            message_expiry: options.message_expiry.or(self.default_message_expiry),
            user_properties,
        };
        debug!(topic = %envelope.topic, "publishing telemetry");
        self.client.publish(envelope).await.map_err(Error::from)
    }
}
