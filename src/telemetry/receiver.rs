//! Telemetry receiver envoy.
//!
//! Subscribes once to the pattern and turns inbound publishes into typed
//! messages: the clock merges every `__ts` stamp, dynamic topic tokens are
//! surfaced, and an attached CloudEvents context is recovered when present.
//! Malformed messages are logged, acked, and dropped; only session loss ends
//! the receiver.

use crate::error::{Error, ErrorKind, Result};
use crate::hlc::{HybridLogicalClock, SharedClock};
use crate::meta::InboundMeta;
use crate::mqtt::{ConnectionState, Envelope, MqttClient, QoS, require_mqtt_v5};
use crate::payload::PayloadCodec;
use crate::telemetry::cloud_event::CloudEvent;
use crate::topic::TopicPattern;
use mqrt_protocol::SUPPORTED_TELEMETRY_MAJORS;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Construction-time configuration.
#[derive(Debug, Clone)]
pub struct TelemetryReceiverOptions {
    /// Telemetry topic pattern; doubles as the subscription filter.
    pub topic_pattern: String,
    /// Constant token bindings.
    pub topic_tokens: HashMap<String, String>,
}

/// One received telemetry message.
#[derive(Debug)]
pub struct TelemetryMessage<T> {
    pub payload: T,
    /// The sender's client id (`__srcId`), when stamped.
    pub sender_id: Option<String>,
    /// Sender clock stamp, already merged into the process clock.
    pub timestamp: Option<HybridLogicalClock>,
    /// CloudEvents context, when the message carries one.
    pub cloud_event: Option<CloudEvent>,
    /// Non-reserved user properties, in wire order.
    pub user_data: Vec<(String, String)>,
    /// Concrete topic the message arrived on.
    pub topic: String,
    /// Token values extracted from the topic (e.g. a sender id token).
    pub topic_tokens: HashMap<String, String>,
}

/// Telemetry receiver envoy; see the module docs.
pub struct TelemetryReceiver<T> {
    client: Arc<dyn MqttClient>,
    filter: String,
    items: mpsc::UnboundedReceiver<Result<TelemetryMessage<T>>>,
    /// `Some` until `start` hands the demarshalling state to its task.
    pending_start: Option<ReceiverTask<T>>,
    shutdown: CancellationToken,
}

struct ReceiverTask<T> {
    clock: SharedClock,
    pattern: TopicPattern,
    items: mpsc::UnboundedSender<Result<TelemetryMessage<T>>>,
}

impl<T> TelemetryReceiver<T>
where
    T: PayloadCodec,
{
    pub fn new(
        client: Arc<dyn MqttClient>,
        clock: SharedClock,
        options: TelemetryReceiverOptions,
    ) -> Result<Self> {
        require_mqtt_v5(client.as_ref())?;
        let pattern = TopicPattern::new(&options.topic_pattern, options.topic_tokens)?;
        let filter = pattern.subscribe_filter();
        let (items_tx, items) = mpsc::unbounded_channel();
        Ok(TelemetryReceiver {
            client,
            filter,
            items,
            pending_start: Some(ReceiverTask { clock, pattern, items: items_tx }),
            shutdown: CancellationToken::new(),
        })
    }

    /// Subscribe and start delivering messages.  Idempotent.
    pub async fn start(&mut self) -> Result<()> {
        let Some(task) = self.pending_start.take() else {
            return Ok(());
        };
        if let Err(e) = self.client.subscribe(&self.filter, QoS::AtLeastOnce).await {
            self.pending_start = Some(task);
            return Err(e.into());
        }
        let messages = self.client.filtered_messages(&self.filter);
        let connection = self.client.connection_state();
        tokio::spawn(receive_loop(task, messages, connection, self.shutdown.clone()));
        Ok(())
    }

    /// Receive the next message.  `Some(Err(..))` carries a terminal receiver
    /// failure (session loss); `None` means the receiver has stopped.
    pub async fn recv(&mut self) -> Option<Result<TelemetryMessage<T>>> {
        self.items.recv().await
    }

    /// Stop receiving and release the subscription best-effort.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        if self.pending_start.is_none() {
            if let Err(e) = self.client.unsubscribe(&self.filter).await {
                debug!(error = %e, filter = %self.filter, "unsubscribe on shutdown");
            }
        }
    }
}

impl<T> Drop for TelemetryReceiver<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn receive_loop<T>(
    task: ReceiverTask<T>,
    mut messages: mpsc::UnboundedReceiver<crate::mqtt::InboundMessage>,
    mut connection: tokio::sync::watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
) where
    T: PayloadCodec,
{
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                if *connection.borrow() == ConnectionState::SessionLost {
                    let _ = task.items.send(Err(Error::new(
                        ErrorKind::ConnectionLost,
                        "MQTT session lost",
                    )));
                    break;
                }
            }
            inbound = messages.recv() => {
                let Some(inbound) = inbound else { break };
                // Dropping the embedded ack token acks the publish whether or
                // not the message survives demarshalling.
                match demarshal(&task, inbound.message) {
                    Ok(message) => {
                        if task.items.send(Ok(message)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "telemetry message dropped");
                    }
                }
            }
        }
    }
}

fn demarshal<T>(task: &ReceiverTask<T>, envelope: Envelope) -> Result<TelemetryMessage<T>>
where
    T: PayloadCodec,
{
    let meta = InboundMeta::parse(&envelope.user_properties)?;
    meta.require_version(SUPPORTED_TELEMETRY_MAJORS)?;
    if let Some(stamp) = &meta.timestamp {
        // A drift failure withholds the message from the user.
        task.clock.observe(stamp)?;
    }
    let cloud_event =
        CloudEvent::from_properties(&meta.user_data, envelope.content_type.as_deref())?;
    let payload = T::decode(
        &envelope.payload,
        envelope.content_type.as_deref(),
        envelope.format_indicator,
    )
    .map_err(|e| Error::new(ErrorKind::PayloadInvalid, e.to_string()))?;
    let topic_tokens = task.pattern.match_topic(&envelope.topic).unwrap_or_default();
    Ok(TelemetryMessage {
        payload,
        sender_id: meta.source_id,
        timestamp: meta.timestamp,
        cloud_event,
        user_data: meta.user_data,
        topic: envelope.topic,
        topic_tokens,
    })
}
