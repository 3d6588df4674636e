//! The MQTT client contract consumed by every envoy.
//!
//! The runtime does not implement MQTT; it consumes a connected v5 client
//! through [`MqttClient`].  One client is shared by all envoys in a process.
//! An envoy holds the client strongly; the client refers back to the envoy
//! only through the message channel handed out by `filtered_messages`, so
//! dropping the envoy's receiver severs the cycle and ends delivery.

use crate::error::{Error, ErrorKind, Result};
use crate::payload::FormatIndicator;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// MQTT quality of service.  The runtime publishes and subscribes at QoS 1
/// unless told otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

/// One MQTT v5 PUBLISH, outbound or inbound.
///
/// Retain is always false for RPC and telemetry; the field exists so the
/// envelope can describe any publish the dispatch loop sees.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub content_type: Option<String>,
    pub format_indicator: FormatIndicator,
    /// Opaque bytes; a 16-byte UUID for RPC and streams, absent for telemetry.
    pub correlation_data: Option<Bytes>,
    /// Invoker-chosen; `clients/{invokerClientId}/…` by default.
    pub response_topic: Option<String>,
    /// Second resolution on the wire.
    pub message_expiry: Option<Duration>,
    /// Ordered, case-sensitive.  Names beginning with `__` are
    /// protocol-owned.
    pub user_properties: Vec<(String, String)>,
}

impl Envelope {
    /// First value of the named user property.
    pub fn user_property(&self, name: &str) -> Option<&str> {
        self.user_properties
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Settles the broker acknowledgement of an inbound QoS-1 publish.
///
/// Dropping the token acknowledges too, so every dispatch path settles the
/// message; [`AckToken::ack`] exists for the paths that must sequence the ack
/// after another operation (classical RPC acks after the response publish).
#[derive(Debug)]
pub struct AckToken {
    tx: Option<oneshot::Sender<()>>,
}

impl AckToken {
    /// Token plus the receiver the client side resolves the PUBACK from.
    pub fn channel() -> (AckToken, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (AckToken { tx: Some(tx) }, rx)
    }

    pub fn ack(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }

    /// Consume the token *without* acknowledging, leaving the publish
    /// eligible for broker redelivery.  Used when the response publish failed
    /// and the request must be replayed.
    pub fn abandon(mut self) {
        self.tx = None;
    }
}

impl Drop for AckToken {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// An inbound publish plus its ack token.
#[derive(Debug)]
pub struct InboundMessage {
    pub message: Envelope,
    /// `None` once taken, or for QoS 0 deliveries.
    pub ack: Option<AckToken>,
}

impl InboundMessage {
    /// Take the ack token, leaving auto-ack-on-drop behaviour to the caller.
    pub fn take_ack(&mut self) -> Option<AckToken> {
        self.ack.take()
    }
}

/// Connection lifecycle as observed by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Connected,
    /// Transport down, session intact: correlation entries survive, queued
    /// publishes flush on reconnect.
    Disconnected,
    /// Session gone: outstanding operations fail with `ConnectionLost`.
    SessionLost,
}

/// Client-side failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MqttError {
    #[error("mqtt client closed")]
    Closed,
    #[error("mqtt session lost")]
    SessionLost,
    #[error("broker rejected operation: {0}")]
    Rejected(String),
}

impl From<MqttError> for Error {
    fn from(e: MqttError) -> Self {
        match e {
            MqttError::Closed | MqttError::SessionLost => {
                Error::new(ErrorKind::ConnectionLost, e.to_string())
            }
            MqttError::Rejected(_) => Error::new(ErrorKind::StateInvalid, e.to_string()),
        }
    }
}

/// The capability set the runtime needs from an MQTT v5 client.
///
/// `publish` resolves when the broker acknowledges delivery (PUBACK for
/// QoS 1); while disconnected with a live session, implementations queue and
/// flush on reconnect.
#[async_trait]
pub trait MqttClient: Send + Sync + 'static {
    /// The client id negotiated with the broker; also the node id of the
    /// process clock and the source id stamped on outbound messages.
    fn client_id(&self) -> &str;

    /// MQTT protocol level; must be 5.
    fn mqtt_version(&self) -> u8;

    async fn publish(&self, envelope: Envelope) -> std::result::Result<(), MqttError>;

    async fn subscribe(&self, filter: &str, qos: QoS) -> std::result::Result<(), MqttError>;

    async fn unsubscribe(&self, filter: &str) -> std::result::Result<(), MqttError>;

    /// Channel of inbound publishes matching `filter`, in broker delivery
    /// order.  Dropping the receiver unregisters the route.
    fn filtered_messages(&self, filter: &str) -> mpsc::UnboundedReceiver<InboundMessage>;

    /// Watch of the connection lifecycle.
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;
}

/// Envoy-construction guard: the protocol requires MQTT v5 features
/// (user properties, correlation data, response topic, message expiry).
pub(crate) fn require_mqtt_v5(client: &dyn MqttClient) -> Result<()> {
    let version = client.mqtt_version();
    if version == 5 {
        Ok(())
    } else {
        Err(Error::shallow(
            ErrorKind::ConfigurationInvalid,
            format!("MQTT v5 required, client speaks v{version}"),
        ))
    }
}
