// Invocation deadlines, caller cancellation, and session loss, all against
// an executor that never answers.

use mqrt::mqtt::MqttClient;
use mqrt::{
    CommandExecutor, CommandExecutorOptions, CommandInvoker, CommandInvokerOptions, CommandReply,
    CommandRequest, Envelope, ErrorKind, InvokeOptions, Json, QoS, SharedClock,
};
use mqrt_test_utils::MockBroker;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ping;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Pong;

type Req = Json<Ping>;
type Resp = Json<Pong>;

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

/// Test: with the executor offline, a 500 ms timeout resolves the handle with
/// `Timeout`, and a late response is acked and discarded without notifying
/// the user.
#[tokio::test(start_paused = true)]
async fn timeout_resolves_handle_and_late_response_is_discarded() {
    let broker = MockBroker::new();
    let invoker = build_invoker(&broker);

    let err = invoker
        .invoke(
            Json(Ping),
            InvokeOptions { timeout: Duration::from_millis(500), ..InvokeOptions::default() },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);

    // Fake the executor answering 2 seconds later.
    let request = broker.published_to("counter/inc")[0].clone();
    let late_executor = broker.client("late-exec");
    let late = Envelope {
        topic: request.response_topic.clone().unwrap(),
        qos: QoS::AtLeastOnce,
        correlation_data: request.correlation_data.clone(),
        user_properties: vec![
            ("__srcId".to_owned(), "late-exec".to_owned()),
            ("__protVer".to_owned(), "0.1".to_owned()),
        ],
        ..Envelope::default()
    };
    tokio::time::sleep(Duration::from_secs(2)).await;
    late_executor.publish(late).await.unwrap();
    tokio::task::yield_now().await;

    // The invoker stays quiet: no new publish, no panic, and the dispatch
    // loop acked the straggler.
    broker.settled(&request.response_topic.unwrap()).await;
    assert_eq!(broker.published_to("counter/inc").len(), 1);
}

/// Test: cancelling the caller token resolves the handle with `Cancelled`
/// without waiting for the executor.
#[tokio::test]
async fn caller_cancellation_resolves_immediately() {
    let broker = MockBroker::new();
    let invoker = build_invoker(&broker);

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    });

    let err = invoker
        .invoke_with_cancellation(
            Json(Ping),
            InvokeOptions { timeout: Duration::from_secs(60), ..InvokeOptions::default() },
            token,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Cancelled);
}

/// Test: losing the MQTT session completes outstanding invocations with
/// `ConnectionLost`.
#[tokio::test]
async fn session_loss_fails_outstanding_invocations() {
    let broker = MockBroker::new();
    let invoker = build_invoker(&broker);

    let pending = tokio::spawn(async move {
        invoker
            .invoke(
                Json(Ping),
                InvokeOptions { timeout: Duration::from_secs(60), ..InvokeOptions::default() },
            )
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    broker.lose_session("inv");

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConnectionLost);
}

/// Test: a handler that outlives the request's message expiry gets its
/// cancellation token fired and the invoker sees a remote `Timeout`.
#[tokio::test(start_paused = true)]
async fn slow_handler_reports_timeout_back() {
    let broker = MockBroker::new();
    let executor: CommandExecutor<Req, Resp> = CommandExecutor::new(
        broker.client("exec"),
        SharedClock::new("exec").unwrap(),
        CommandExecutorOptions::new("counter/inc"),
        |request: CommandRequest<Req>| async move {
            // Refuses to finish until told to stop.
            request.cancellation.cancelled().await;
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(CommandReply::new(Json(Pong)))
        },
    )
    .unwrap();
    executor.start().await.unwrap();
    let invoker = build_invoker(&broker);

    // A short message expiry bounds the handler while the invoker itself
    // waits much longer, so the Timeout it sees is the executor's report.
    let err = invoker
        .invoke(
            Json(Ping),
            InvokeOptions {
                timeout: Duration::from_secs(60),
                message_expiry: Some(Duration::from_secs(2)),
                ..InvokeOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
    assert!(err.is_remote, "the timeout report must come from the executor");
}

/// Test: a disposed invoker refuses further work.
#[tokio::test]
async fn disposed_invoker_rejects_invocations() {
    let broker = MockBroker::new();
    let invoker = build_invoker(&broker);
    invoker.shutdown().await;
    let err = invoker.invoke(Json(Ping), InvokeOptions::default()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Disposed);
}
