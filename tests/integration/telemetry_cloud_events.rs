// Telemetry with CloudEvents context: sender defaults, receiver recovery,
// clock ingestion, and sender-id surfacing.

use mqrt::{
    CloudEvent, Json, SendOptions, SharedClock, TelemetryMessage, TelemetryReceiver,
    TelemetryReceiverOptions, TelemetrySender, TelemetrySenderOptions,
};
use mqrt_test_utils::MockBroker;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Reading {
    temperature: f64,
}

type Payload = Json<Reading>;

fn sender_options(pattern: &str) -> TelemetrySenderOptions {
    TelemetrySenderOptions {
        topic_pattern: pattern.to_owned(),
        topic_tokens: HashMap::new(),
        default_message_expiry: None,
    }
}

fn receiver_options(pattern: &str) -> TelemetryReceiverOptions {
    TelemetryReceiverOptions { topic_pattern: pattern.to_owned(), topic_tokens: HashMap::new() }
}

async fn one_message(
    broker: &MockBroker,
    pattern: &str,
    send_options: SendOptions,
) -> (TelemetryMessage<Payload>, SharedClock) {
    let sender: TelemetrySender<Payload> = TelemetrySender::new(
        broker.client("sensor-1"),
        SharedClock::new("sensor-1").unwrap(),
        sender_options(pattern),
    )
    .unwrap();
    let receiver_clock = SharedClock::new("collector").unwrap();
    let mut receiver: TelemetryReceiver<Payload> = TelemetryReceiver::new(
        broker.client("collector"),
        receiver_clock.clone(),
        receiver_options(pattern),
    )
    .unwrap();
    receiver.start().await.unwrap();

    sender
        .send(Json(Reading { temperature: 21.5 }), send_options)
        .await
        .unwrap();
    let message = receiver.recv().await.unwrap().unwrap();
    (message, receiver_clock)
}

/// Test: a CloudEvent round-trips with its `source` and `type` intact, a
/// generated UUID id, the serializer's content type, and the publish topic
/// as subject.
#[tokio::test]
async fn cloud_event_round_trip() {
    let broker = MockBroker::new();
    let options = SendOptions {
        cloud_event: Some(CloudEvent::new("aio://x").with_type("ms.aio.telemetry")),
        ..SendOptions::default()
    };
    let (message, _) = one_message(&broker, "site/telemetry", options).await;

    let event = message.cloud_event.expect("message must carry a cloud event");
    assert_eq!(event.source, "aio://x");
    assert_eq!(event.event_type, "ms.aio.telemetry");
    assert_eq!(event.spec_version, "1.0");
    assert!(Uuid::parse_str(&event.id.unwrap()).is_ok());
    assert_eq!(event.data_content_type.as_deref(), Some("application/json"));
    assert_eq!(event.subject.as_deref(), Some("site/telemetry"));
    assert!(event.time.is_some());
    assert_eq!(message.payload.0, Reading { temperature: 21.5 });
}

/// Test: the receiver merges the sender's `__ts` stamp, so its next outbound
/// stamp is ordered after the received one; the sender id arrives through
/// `__srcId` without any topic token.
#[tokio::test]
async fn receiver_ingests_stamp_and_sender_id() {
    let broker = MockBroker::new();
    let (message, receiver_clock) =
        one_message(&broker, "site/telemetry", SendOptions::default()).await;

    assert_eq!(message.sender_id.as_deref(), Some("sensor-1"));
    let received_stamp = message.timestamp.expect("telemetry must be stamped");
    let next_outbound = receiver_clock.stamp().unwrap();
    assert!(received_stamp < next_outbound);
    assert!(message.cloud_event.is_none());
}

/// Test: dynamic topic tokens surface on the received message.
#[tokio::test]
async fn dynamic_tokens_surface_on_receive() {
    let broker = MockBroker::new();
    let sender: TelemetrySender<Payload> = TelemetrySender::new(
        broker.client("sensor-7"),
        SharedClock::new("sensor-7").unwrap(),
        sender_options("sensors/{sensorId}/data"),
    )
    .unwrap();
    let mut receiver: TelemetryReceiver<Payload> = TelemetryReceiver::new(
        broker.client("collector"),
        SharedClock::new("collector").unwrap(),
        receiver_options("sensors/{sensorId}/data"),
    )
    .unwrap();
    receiver.start().await.unwrap();

    let mut options = SendOptions::default();
    options.topic_tokens.insert("sensorId".to_owned(), "s7".to_owned());
    sender.send(Json(Reading { temperature: 3.0 }), options).await.unwrap();

    let message = receiver.recv().await.unwrap().unwrap();
    assert_eq!(message.topic, "sensors/s7/data");
    assert_eq!(message.topic_tokens.get("sensorId").unwrap(), "s7");
}

/// Test: a malformed payload is dropped (acked, logged) without disturbing
/// later messages.
#[tokio::test]
async fn malformed_payload_is_dropped_not_fatal() {
    let broker = MockBroker::new();
    let raw_sender = broker.client("chaos");
    let mut receiver: TelemetryReceiver<Payload> = TelemetryReceiver::new(
        broker.client("collector"),
        SharedClock::new("collector").unwrap(),
        receiver_options("site/telemetry"),
    )
    .unwrap();
    receiver.start().await.unwrap();

    use mqrt::mqtt::MqttClient;
    raw_sender
        .publish(mqrt::Envelope {
            topic: "site/telemetry".to_owned(),
            payload: bytes::Bytes::from_static(b"not json"),
            content_type: Some("application/json".to_owned()),
            ..mqrt::Envelope::default()
        })
        .await
        .unwrap();

    let sender: TelemetrySender<Payload> = TelemetrySender::new(
        broker.client("sensor-1"),
        SharedClock::new("sensor-1").unwrap(),
        sender_options("site/telemetry"),
    )
    .unwrap();
    sender.send(Json(Reading { temperature: 9.0 }), SendOptions::default()).await.unwrap();

    // Only the healthy message surfaces.
    let message = receiver.recv().await.unwrap().unwrap();
    assert_eq!(message.payload.0, Reading { temperature: 9.0 });
}
