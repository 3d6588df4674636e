// End-to-end classical RPC over the mock broker: one invoker, one executor,
// one counter-increment command.

use mqrt::{
    CommandExecutor, CommandExecutorOptions, CommandInvoker, CommandInvokerOptions, CommandReply,
    CommandRequest, InvokeOptions, Json, SharedClock,
};
use mqrt_test_utils::{AckState, MockBroker};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Increment {
    counter_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Incremented {
    counter_value: u64,
}

type Req = Json<Increment>;
type Resp = Json<Incremented>;

/// Test: invoker publishes `counter/inc`, executor runs the handler and
/// publishes to `clients/invokerA/counter/inc` with the same correlation
/// data, and the invoker's awaiter resolves with the handler's value.
#[tokio::test]
async fn classical_rpc_success() {
    let broker = MockBroker::new();
    let invoker_client = broker.client("invokerA");
    let executor_client = broker.client("executorA");

    let counter = Arc::new(AtomicU64::new(0));
    let handler_counter = Arc::clone(&counter);
    let executor: CommandExecutor<Req, Resp> = CommandExecutor::new(
        executor_client,
        SharedClock::new("executorA").unwrap(),
        CommandExecutorOptions::new("counter/inc"),
        move |request: CommandRequest<Req>| {
            let counter = Arc::clone(&handler_counter);
            async move {
                assert_eq!(request.payload.0.counter_name, "x");
                assert_eq!(request.source_id, "invokerA");
                let value = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(CommandReply::new(Json(Incremented { counter_value: value })))
            }
        },
    )
    .unwrap();
    executor.start().await.unwrap();

    let invoker: CommandInvoker<Req, Resp> = CommandInvoker::new(
        invoker_client,
        SharedClock::new("invokerA").unwrap(),
        CommandInvokerOptions {
            request_pattern: "counter/inc".to_owned(),
            topic_tokens: HashMap::new(),
            response_topic_prefix: None,
        },
    )
    .unwrap();

    let response = invoker
        .invoke(
            Json(Increment { counter_name: "x".to_owned() }),
            InvokeOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(response.payload.0.counter_value, 1);
    assert!(response.timestamp.is_some(), "response must carry the executor's stamp");

    // Exactly one request and one response crossed the broker, correlated.
    let requests = broker.published_to("counter/inc");
    let responses = broker.published_to("clients/invokerA/counter/inc");
    assert_eq!(requests.len(), 1);
    assert_eq!(responses.len(), 1);
    assert_eq!(requests[0].correlation_data, responses[0].correlation_data);
    assert_eq!(
        requests[0].response_topic.as_deref(),
        Some("clients/invokerA/counter/inc")
    );
    assert_eq!(responses[0].user_property("__srcId"), Some("executorA"));
    assert_eq!(requests[0].user_property("__srcId"), Some("invokerA"));
    assert_eq!(requests[0].user_property("__protVer"), Some("0.1"));

    // Ack-after-publish: the request delivery settles acked once the
    // response is out.
    broker.settled("counter/inc").await;
    assert_eq!(broker.ack_states("counter/inc"), vec![AckState::Acked]);
}

/// Test: user data survives the round trip in both directions, and reserved
/// names never reach user code.
#[tokio::test]
async fn user_data_round_trips_without_reserved_names() {
    let broker = MockBroker::new();
    let invoker_client = broker.client("inv");
    let executor_client = broker.client("exec");

    let executor: CommandExecutor<Req, Resp> = CommandExecutor::new(
        executor_client,
        SharedClock::new("exec").unwrap(),
        CommandExecutorOptions::new("counter/inc"),
        |request: CommandRequest<Req>| async move {
            assert_eq!(
                request.user_data,
                vec![("tenant".to_owned(), "t1".to_owned())],
                "reserved properties must not surface as user data"
            );
            let mut reply = CommandReply::new(Json(Incremented { counter_value: 7 }));
            reply.user_data.push(("shard".to_owned(), "s9".to_owned()));
            Ok(reply)
        },
    )
    .unwrap();
    executor.start().await.unwrap();

    let invoker: CommandInvoker<Req, Resp> = CommandInvoker::new(
        invoker_client,
        SharedClock::new("inv").unwrap(),
        CommandInvokerOptions {
            request_pattern: "counter/inc".to_owned(),
            topic_tokens: HashMap::new(),
            response_topic_prefix: None,
        },
    )
    .unwrap();

    let response = invoker
        .invoke(
            Json(Increment { counter_name: "x".to_owned() }),
            InvokeOptions {
                user_data: vec![("tenant".to_owned(), "t1".to_owned())],
                ..InvokeOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(response.user_data, vec![("shard".to_owned(), "s9".to_owned())]);
}

/// Test: a handler failure surfaces on the invoker as a remote, in-application
/// error.
#[tokio::test]
async fn handler_failure_is_remote_executor_error() {
    let broker = MockBroker::new();
    let invoker_client = broker.client("inv");
    let executor_client = broker.client("exec");

    let executor: CommandExecutor<Req, Resp> = CommandExecutor::new(
        executor_client,
        SharedClock::new("exec").unwrap(),
        CommandExecutorOptions::new("counter/inc"),
        |_request: CommandRequest<Req>| async move { Err("counter store unavailable".to_owned()) },
    )
    .unwrap();
    executor.start().await.unwrap();

    let invoker: CommandInvoker<Req, Resp> = CommandInvoker::new(
        invoker_client,
        SharedClock::new("inv").unwrap(),
        CommandInvokerOptions {
            request_pattern: "counter/inc".to_owned(),
            topic_tokens: HashMap::new(),
            response_topic_prefix: None,
        },
    )
    .unwrap();

    let err = invoker
        .invoke(
            Json(Increment { counter_name: "x".to_owned() }),
            InvokeOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, mqrt::ErrorKind::ExecutorError);
    assert!(err.is_remote && err.in_application);
    assert_eq!(err.message, "counter store unavailable");
}

/// Test: transient topic tokens resolve the request topic per call and reach
/// the executor as extracted token values.
#[tokio::test]
async fn transient_tokens_resolve_and_extract() {
    let broker = MockBroker::new();
    let invoker_client = broker.client("inv");
    let executor_client = broker.client("exec");

    let executor: CommandExecutor<Req, Resp> = CommandExecutor::new(
        executor_client,
        SharedClock::new("exec").unwrap(),
        CommandExecutorOptions::new("fleet/{vehicleId}/counter/inc"),
        |request: CommandRequest<Req>| async move {
            assert_eq!(request.topic_tokens.get("vehicleId").unwrap(), "v42");
            Ok(CommandReply::new(Json(Incremented { counter_value: 1 })))
        },
    )
    .unwrap();
    executor.start().await.unwrap();

    let invoker: CommandInvoker<Req, Resp> = CommandInvoker::new(
        invoker_client,
        SharedClock::new("inv").unwrap(),
        CommandInvokerOptions {
            request_pattern: "fleet/{vehicleId}/counter/inc".to_owned(),
            topic_tokens: HashMap::new(),
            response_topic_prefix: None,
        },
    )
    .unwrap();

    let mut options = InvokeOptions::default();
    options.topic_tokens.insert("vehicleId".to_owned(), "v42".to_owned());
    invoker
        .invoke(Json(Increment { counter_name: "x".to_owned() }), options)
        .await
        .unwrap();
    assert_eq!(broker.published_to("fleet/v42/counter/inc").len(), 1);
}

/// Test: a non-v5 client is rejected at envoy construction.
#[tokio::test]
async fn mqtt_v3_client_is_rejected() {
    let broker = MockBroker::new();
    let old_client = broker.client_with_version("old", 4);
    let err = CommandInvoker::<Req, Resp>::new(
        old_client,
        SharedClock::new("old").unwrap(),
        CommandInvokerOptions {
            request_pattern: "counter/inc".to_owned(),
            topic_tokens: HashMap::new(),
            response_topic_prefix: None,
        },
    )
    .unwrap_err();
    assert_eq!(err.kind, mqrt::ErrorKind::ConfigurationInvalid);
    assert!(err.is_shallow);
}
