// Streamed RPC end to end: request frames in, response frames out, framing
// metadata on the wire.

use futures_util::StreamExt;
use mqrt::{
    Json, SharedClock, StreamExecutor, StreamExecutorOptions, StreamInvokeOptions, StreamInvoker,
    StreamInvokerOptions, StreamOutput, StreamRequest,
};
use mqrt_test_utils::MockBroker;
use std::collections::HashMap;

type Frame = Json<u64>;

fn build_executor(broker: &MockBroker) -> StreamExecutor<Frame, Frame> {
    StreamExecutor::new(
        broker.client("exec"),
        SharedClock::new("exec").unwrap(),
        StreamExecutorOptions::new("math/double"),
        |request: StreamRequest<Frame>| {
            Box::pin(request.frames.map(|Json(v)| Ok::<_, String>(Json(v * 2))))
                as StreamOutput<Frame>
        },
    )
    .unwrap()
}

fn build_invoker(broker: &MockBroker) -> StreamInvoker<Frame, Frame> {
    StreamInvoker::new(
        broker.client("inv"),
        SharedClock::new("inv").unwrap(),
        StreamInvokerOptions {
            request_pattern: "math/double".to_owned(),
            topic_tokens: HashMap::new(),
            response_topic_prefix: None,
        },
    )
    .unwrap()
}

/// Test: three request frames produce three response frames in receipt
/// order, then the stream closes cleanly.
#[tokio::test]
async fn stream_echo_roundtrip() {
    mqrt_test_utils::init_tracing();
    let broker = MockBroker::new();
    let executor = build_executor(&broker);
    executor.start().await.unwrap();
    let invoker = build_invoker(&broker);

    let requests = futures_util::stream::iter(vec![Json(1u64), Json(2), Json(3)]);
    let mut responses =
        invoker.invoke(requests, StreamInvokeOptions::default()).await.unwrap();

    let mut received = Vec::new();
    while let Some(item) = responses.recv().await {
        received.push(item.unwrap().payload.0);
    }
    assert_eq!(received, vec![2, 4, 6]);
}

/// Test: wire framing. Request frames carry `index:0:0:timeout` with the
/// timeout repeated on every frame, followed by one empty terminator; the
/// response direction carries exactly one `isLast` frame.
#[tokio::test]
async fn stream_framing_on_the_wire() {
    let broker = MockBroker::new();
    let executor = build_executor(&broker);
    executor.start().await.unwrap();
    let invoker = build_invoker(&broker);

    let requests = futures_util::stream::iter(vec![Json(5u64), Json(6)]);
    let mut responses = invoker
        .invoke(
            requests,
            StreamInvokeOptions {
                timeout: std::time::Duration::from_secs(5),
                ..StreamInvokeOptions::default()
            },
        )
        .await
        .unwrap();
    while let Some(item) = responses.recv().await {
        item.unwrap();
    }

    let request_frames: Vec<String> = broker
        .published_to("math/double")
        .iter()
        .map(|e| e.user_property("__stream").unwrap().to_owned())
        .collect();
    assert_eq!(request_frames, vec!["0:0:0:5000", "1:0:0:5000", "2:1:0:5000"]);

    let request_payload_sizes: Vec<usize> =
        broker.published_to("math/double").iter().map(|e| e.payload.len()).collect();
    assert!(request_payload_sizes[0] > 0 && request_payload_sizes[1] > 0);
    assert_eq!(request_payload_sizes[2], 0, "terminator carries no payload");

    let response_frames: Vec<String> = broker
        .published_to("clients/inv/math/double")
        .iter()
        .map(|e| e.user_property("__stream").unwrap().to_owned())
        .collect();
    assert_eq!(response_frames, vec!["0:0:0", "1:0:0", "2:1:0"]);
    let last_frames =
        response_frames.iter().filter(|f| f.split(':').nth(1) == Some("1")).count();
    assert_eq!(last_frames, 1, "exactly one response frame may be last");

    // Streams share the correlation mechanism: every frame of the exchange
    // carries the same correlation data.
    let all = broker.published();
    let correlation = all[0].correlation_data.clone().unwrap();
    assert!(all.iter().all(|e| e.correlation_data.as_ref() == Some(&correlation)));
}

/// Test: a terminator arriving as the first-ever frame on a correlation id
/// never opens a stream; the handler is not invoked and nothing is published
/// back.
#[tokio::test]
async fn lone_terminator_never_reaches_handler() {
    use mqrt::mqtt::MqttClient;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    let broker = MockBroker::new();
    let opened = Arc::new(AtomicU64::new(0));
    let handler_opened = Arc::clone(&opened);
    let executor: StreamExecutor<Frame, Frame> = StreamExecutor::new(
        broker.client("exec"),
        SharedClock::new("exec").unwrap(),
        StreamExecutorOptions::new("math/double"),
        move |request: StreamRequest<Frame>| {
            handler_opened.fetch_add(1, Ordering::SeqCst);
            Box::pin(request.frames.map(|frame| Ok::<_, String>(frame))) as StreamOutput<Frame>
        },
    )
    .unwrap();
    executor.start().await.unwrap();

    let rogue = broker.client("rogue");
    rogue
        .publish(mqrt::Envelope {
            topic: "math/double".to_owned(),
            correlation_data: Some(bytes::Bytes::copy_from_slice(
                uuid::Uuid::new_v4().as_bytes(),
            )),
            response_topic: Some("clients/rogue/math/double".to_owned()),
            user_properties: vec![
                ("__srcId".to_owned(), "rogue".to_owned()),
                ("__protVer".to_owned(), "0.1".to_owned()),
                ("__stream".to_owned(), "0:1:0:5000".to_owned()),
            ],
            ..mqrt::Envelope::default()
        })
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(opened.load(Ordering::SeqCst), 0, "handler must not be invoked");
    assert!(broker.published_to("clients/rogue/math/double").is_empty());
}

/// Test: a handler failure mid-stream ends the consumer with a remote
/// `ExecutorError` after the frames that preceded it.
#[tokio::test]
async fn handler_failure_ends_stream_with_error() {
    let broker = MockBroker::new();
    let executor: StreamExecutor<Frame, Frame> = StreamExecutor::new(
        broker.client("exec"),
        SharedClock::new("exec").unwrap(),
        StreamExecutorOptions::new("math/double"),
        |request: StreamRequest<Frame>| {
            Box::pin(request.frames.map(|Json(v)| {
                if v > 1 { Err("value out of range".to_owned()) } else { Ok(Json(v)) }
            })) as StreamOutput<Frame>
        },
    )
    .unwrap();
    executor.start().await.unwrap();
    let invoker = build_invoker(&broker);

    let requests = futures_util::stream::iter(vec![Json(1u64), Json(2)]);
    let mut responses =
        invoker.invoke(requests, StreamInvokeOptions::default()).await.unwrap();

    let first = responses.recv().await.unwrap().unwrap();
    assert_eq!(first.payload.0, 1);
    let err = responses.recv().await.unwrap().unwrap_err();
    assert_eq!(err.kind, mqrt::ErrorKind::ExecutorError);
    assert!(err.is_remote);
    assert_eq!(err.message, "value out of range");
    assert!(responses.recv().await.is_none());
}
