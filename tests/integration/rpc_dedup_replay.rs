// Broker redelivery against the executor dedup cache: the handler runs once
// per request fingerprint, duplicates replay the stored response.

use mqrt::{
    CommandExecutor, CommandExecutorOptions, CommandInvoker, CommandInvokerOptions, CommandReply,
    CommandRequest, InvokeOptions, Json, SharedClock,
};
use mqrt_test_utils::MockBroker;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ping;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Pong {
    run: u64,
}

type Req = Json<Ping>;
type Resp = Json<Pong>;

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {what}");
}

fn build_executor(
    broker: &MockBroker,
    cacheable_ttl: Option<Duration>,
    idempotent: bool,
) -> (CommandExecutor<Req, Resp>, Arc<AtomicU64>) {
    let runs = Arc::new(AtomicU64::new(0));
    let handler_runs = Arc::clone(&runs);
    let mut options = CommandExecutorOptions::new("counter/inc");
    options.cacheable_ttl = cacheable_ttl;
    options.idempotent = idempotent;
    let executor = CommandExecutor::new(
        broker.client("exec"),
        SharedClock::new("exec").unwrap(),
        options,
        move |_request: CommandRequest<Req>| {
            let runs = Arc::clone(&handler_runs);
            async move {
                let run = runs.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(CommandReply::new(Json(Pong { run })))
            }
        },
    )
    .unwrap();
    (executor, runs)
}

fn build_invoker(broker: &MockBroker) -> CommandInvoker<Req, Resp> {
    CommandInvoker::new(
        broker.client("inv"),
        SharedClock::new("inv").unwrap(),
        CommandInvokerOptions {
            request_pattern: "counter/inc".to_owned(),
            topic_tokens: HashMap::new(),
            response_topic_prefix: None,
        },
    )
    .unwrap()
}

/// Test: redelivering the identical request does not re-invoke the handler;
/// the cached response is republished with the same correlation data.
#[tokio::test]
async fn redelivery_replays_cached_response() {
    mqrt_test_utils::init_tracing();
    let broker = MockBroker::new();
    let (executor, runs) = build_executor(&broker, Some(Duration::from_secs(60)), false);
    executor.start().await.unwrap();
    let invoker = build_invoker(&broker);

    let response = invoker.invoke(Json(Ping), InvokeOptions::default()).await.unwrap();
    assert_eq!(response.payload.0.run, 1);

    let request = broker.published_to("counter/inc")[0].clone();
    broker.redeliver(&request);

    let broker_poll = broker.clone();
    wait_for("replayed response", move || {
        broker_poll.published_to("clients/inv/counter/inc").len() == 2
    })
    .await;

    assert_eq!(runs.load(Ordering::SeqCst), 1, "handler must not run twice");
    let responses = broker.published_to("clients/inv/counter/inc");
    assert_eq!(responses[0].correlation_data, responses[1].correlation_data);
}

/// Test: distinct invocations have distinct fingerprints and each runs the
/// handler.
#[tokio::test]
async fn distinct_invocations_are_not_deduplicated() {
    let broker = MockBroker::new();
    let (executor, runs) = build_executor(&broker, Some(Duration::from_secs(60)), false);
    executor.start().await.unwrap();
    let invoker = build_invoker(&broker);

    invoker.invoke(Json(Ping), InvokeOptions::default()).await.unwrap();
    invoker.invoke(Json(Ping), InvokeOptions::default()).await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// Test: a non-cacheable command drops its outcome once the response ack is
/// confirmed, so a much later redelivery runs the handler again (permitted
/// for idempotent commands).
#[tokio::test]
async fn non_cacheable_outcome_is_dropped_after_ack() {
    let broker = MockBroker::new();
    let (executor, runs) = build_executor(&broker, None, true);
    executor.start().await.unwrap();
    let invoker = build_invoker(&broker);

    invoker.invoke(Json(Ping), InvokeOptions::default()).await.unwrap();
    broker.settled("counter/inc").await;

    let request = broker.published_to("counter/inc")[0].clone();
    broker.redeliver(&request);

    let runs_poll = Arc::clone(&runs);
    wait_for("second handler run", move || runs_poll.load(Ordering::SeqCst) == 2).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// A request envelope as an invoker would publish it, without the invoker
/// (whose awaiter would get in the way of the unconfirmed-ack window below).
fn raw_request(source_id: &str) -> mqrt::Envelope {
    mqrt::Envelope {
        topic: "counter/inc".to_owned(),
        payload: bytes::Bytes::from(serde_json::to_vec(&Ping).unwrap()),
        content_type: Some("application/json".to_owned()),
        format_indicator: mqrt::FormatIndicator::Utf8Text,
        correlation_data: Some(bytes::Bytes::copy_from_slice(
            uuid::Uuid::new_v4().as_bytes(),
        )),
        response_topic: Some(format!("clients/{source_id}/counter/inc")),
        user_properties: vec![
            ("__srcId".to_owned(), source_id.to_owned()),
            ("__protVer".to_owned(), "0.1".to_owned()),
        ],
        ..mqrt::Envelope::default()
    }
}

/// Test: while the response publish is still unconfirmed (the executor's
/// session is gone, so the publish fails and the request stays unacked), a
/// duplicate of a non-idempotent command replays the stored outcome without
/// re-invoking the handler.
#[tokio::test]
async fn non_idempotent_holds_outcome_until_response_ack() {
    use mqrt::mqtt::MqttClient;

    let broker = MockBroker::new();
    let (executor, runs) = build_executor(&broker, None, false);
    executor.start().await.unwrap();
    broker.lose_session("exec");

    let sender = broker.client("rawinv");
    let request = raw_request("rawinv");
    sender.publish(request.clone()).await.unwrap();

    let runs_poll = Arc::clone(&runs);
    wait_for("first handler run", move || runs_poll.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    broker.redeliver(&request);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        runs.load(Ordering::SeqCst),
        1,
        "a duplicate in the unconfirmed-ack window must replay, not re-run"
    );
}

/// Test: the same window for an idempotent command re-runs the handler; its
/// outcome was released as soon as the handler completed.
#[tokio::test]
async fn idempotent_releases_outcome_at_completion() {
    use mqrt::mqtt::MqttClient;

    let broker = MockBroker::new();
    let (executor, runs) = build_executor(&broker, None, true);
    executor.start().await.unwrap();
    broker.lose_session("exec");

    let sender = broker.client("rawinv");
    let request = raw_request("rawinv");
    sender.publish(request.clone()).await.unwrap();

    let runs_poll = Arc::clone(&runs);
    wait_for("first handler run", move || runs_poll.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    broker.redeliver(&request);
    let runs_poll = Arc::clone(&runs);
    wait_for("second handler run", move || runs_poll.load(Ordering::SeqCst) == 2).await;
}
