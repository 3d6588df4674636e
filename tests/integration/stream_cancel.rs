// Stream cancellation in both directions: the cancel frame crosses on the
// opposite direction's topic, the other side stops and confirms with a final
// Cancelled frame, and stragglers die quietly in the grace window.

use futures_util::StreamExt;
use mqrt::{
    ErrorKind, Json, SharedClock, StreamExecutor, StreamExecutorOptions, StreamInvokeOptions,
    StreamInvoker, StreamInvokerOptions, StreamOutput, StreamRequest,
};
use mqrt_test_utils::MockBroker;
use std::collections::HashMap;
use std::time::Duration;

type Frame = Json<u64>;

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Test: the invoker cancels an open stream; the consumer resolves with
/// `Cancelled` without waiting, the wire shows the `0:1:1:0` cancel frame,
/// and the executor's final Cancelled frame arrives as an absorbed straggler.
#[tokio::test]
async fn invoker_cancel_stops_both_sides() {
    mqrt_test_utils::init_tracing();
    let broker = MockBroker::new();

    // A producer that keeps emitting until the runtime cancels it.
    let executor: StreamExecutor<Frame, Frame> = StreamExecutor::new(
        broker.client("exec"),
        SharedClock::new("exec").unwrap(),
        StreamExecutorOptions::new("feed/live"),
        |_request: StreamRequest<Frame>| {
            Box::pin(async_stream::stream! {
                let mut i = 0u64;
                loop {
                    if false {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    yield Ok::<_, String>(Json(i));
                    i += 1;
                }
            }) as StreamOutput<Frame>
        },
    )
    .unwrap();
    executor.start().await.unwrap();

    let invoker: StreamInvoker<Frame, Frame> = StreamInvoker::new(
        broker.client("inv"),
        SharedClock::new("inv").unwrap(),
        StreamInvokerOptions {
            request_pattern: "feed/live".to_owned(),
            topic_tokens: HashMap::new(),
            response_topic_prefix: None,
        },
    )
    .unwrap();

    let requests = futures_util::stream::iter(vec![Json(0u64), Json(1)]);
    let mut responses = invoker
        .invoke(
            requests,
            StreamInvokeOptions {
                timeout: Duration::from_secs(5),
                ..StreamInvokeOptions::default()
            },
        )
        .await
        .unwrap();

    // Take a couple of frames, then cancel out of band.
    let first = responses.recv().await.unwrap().unwrap();
    let second = responses.recv().await.unwrap().unwrap();
    assert_eq!((first.payload.0, second.payload.0), (0, 1));

    responses.cancel().await;
    let mut filtered = std::pin::pin!(responses.by_ref().filter_map(|item| async { item.err() }));
    let outcome = filtered.next().await;
    assert_eq!(outcome.unwrap().kind, ErrorKind::Cancelled);

    // The cancel frame crossed in the request direction.
    let broker_poll = broker.clone();
    wait_for("cancel frame", move || {
        broker_poll
            .published_to("feed/live")
            .iter()
            .any(|e| e.user_property("__stream") == Some("0:1:1:0") && e.payload.is_empty())
    })
    .await;

    // The executor confirmed with a final Cancelled frame on the response
    // topic; by then the invoker had retired the correlation id, so the
    // frame is a straggler and is simply acked.
    let broker_poll = broker.clone();
    wait_for("final Cancelled frame", move || {
        broker_poll
            .published_to("clients/inv/feed/live")
            .iter()
            .any(|e| e.user_property("AppErrCode") == Some("Cancelled"))
    })
    .await;
}

/// Test: shutting the executor down cancels open streams toward the invoker:
/// the cancel frame crosses in the response direction, the consumer resolves
/// with a remote `Cancelled` without riding out its deadline, and the
/// invoker confirms with a final Cancelled frame on the request topic.
#[tokio::test]
async fn executor_shutdown_cancels_open_streams() {
    mqrt_test_utils::init_tracing();
    let broker = MockBroker::new();

    let executor: StreamExecutor<Frame, Frame> = StreamExecutor::new(
        broker.client("exec"),
        SharedClock::new("exec").unwrap(),
        StreamExecutorOptions::new("feed/live"),
        |_request: StreamRequest<Frame>| {
            Box::pin(async_stream::stream! {
                let mut i = 0u64;
                loop {
                    if false {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    yield Ok::<_, String>(Json(i));
                    i += 1;
                }
            }) as StreamOutput<Frame>
        },
    )
    .unwrap();
    executor.start().await.unwrap();

    let invoker: StreamInvoker<Frame, Frame> = StreamInvoker::new(
        broker.client("inv"),
        SharedClock::new("inv").unwrap(),
        StreamInvokerOptions {
            request_pattern: "feed/live".to_owned(),
            topic_tokens: HashMap::new(),
            response_topic_prefix: None,
        },
    )
    .unwrap();

    let requests = futures_util::stream::iter(vec![Json(0u64)]);
    let mut responses = invoker
        .invoke(
            requests,
            StreamInvokeOptions {
                timeout: Duration::from_secs(60),
                ..StreamInvokeOptions::default()
            },
        )
        .await
        .unwrap();

    // The stream is live once the first response frame lands.
    responses.recv().await.unwrap().unwrap();

    executor.shutdown().await;

    let mut filtered = std::pin::pin!(responses.by_ref().filter_map(|item| async { item.err() }));
    let outcome = filtered.next().await;
    let err = outcome.unwrap();
    assert_eq!(err.kind, ErrorKind::Cancelled);
    assert!(err.is_remote, "the stop must come from the executor");
    assert!(responses.recv().await.is_none());

    // The cancel frame crossed in the response direction.
    let broker_poll = broker.clone();
    wait_for("cancel frame", move || {
        broker_poll
            .published_to("clients/inv/feed/live")
            .iter()
            .any(|e| e.user_property("__stream") == Some("0:1:1:0") && e.payload.is_empty())
    })
    .await;

    // The invoker confirmed on the request topic before resolving its
    // consumer.
    let broker_poll = broker.clone();
    wait_for("invoker Cancelled confirmation", move || {
        broker_poll
            .published_to("feed/live")
            .iter()
            .any(|e| e.user_property("AppErrCode") == Some("Cancelled"))
    })
    .await;
}

/// Test: the stream deadline expires when the executor never closes its side;
/// the consumer observes `Timeout`.
#[tokio::test(start_paused = true)]
async fn stream_deadline_expires() {
    mqrt_test_utils::init_tracing();
    let broker = MockBroker::new();

    // An executor that answers the first frame and then stalls forever.
    let executor: StreamExecutor<Frame, Frame> = StreamExecutor::new(
        broker.client("exec"),
        SharedClock::new("exec").unwrap(),
        StreamExecutorOptions::new("feed/slow"),
        |request: StreamRequest<Frame>| {
            Box::pin(async_stream::stream! {
                let mut frames = request.frames;
                if let Some(Json(v)) = frames.next().await {
                    yield Ok::<_, String>(Json(v));
                }
                std::future::pending::<()>().await;
            }) as StreamOutput<Frame>
        },
    )
    .unwrap();
    executor.start().await.unwrap();

    let invoker: StreamInvoker<Frame, Frame> = StreamInvoker::new(
        broker.client("inv"),
        SharedClock::new("inv").unwrap(),
        StreamInvokerOptions {
            request_pattern: "feed/slow".to_owned(),
            topic_tokens: HashMap::new(),
            response_topic_prefix: None,
        },
    )
    .unwrap();

    let requests = futures_util::stream::iter(vec![Json(9u64)]);
    let mut responses = invoker
        .invoke(
            requests,
            StreamInvokeOptions {
                timeout: Duration::from_millis(800),
                ..StreamInvokeOptions::default()
            },
        )
        .await
        .unwrap();

    let first = responses.recv().await.unwrap().unwrap();
    assert_eq!(first.payload.0, 9);
    let err = responses.recv().await.unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
    assert!(responses.recv().await.is_none());
}
