//! Executor side of streamed RPC.
//!
//! The first matching request frame opens a session and invokes the user's
//! streaming handler; later frames feed the handler's input in receipt order.
//! Every request frame is acked on receipt so a long stream never blocks the
//! client's inbound dispatch.  Streamed commands bypass the dedup cache:
//! streams may grow without bound.

use crate::error::{Error, ErrorKind, Result};
use crate::hlc::{HybridLogicalClock, SharedClock};
use crate::meta::{InboundMeta, OutboundMeta};
use crate::mqtt::{Envelope, InboundMessage, MqttClient, QoS, require_mqtt_v5};
use crate::payload::PayloadCodec;
use crate::rpc::cache::Fingerprint;
use crate::rpc::correlation_uuid;
use crate::rpc::streaming::{FrameKind, StreamPhase, classify};
use crate::topic::TopicPattern;
use futures_util::{Stream, StreamExt};
use mqrt_protocol::{
    AppErrorDetail, PROP_SOURCE_ID, STREAM_VERSION, SUPPORTED_STREAM_MAJORS, StreamFrame, codes,
};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OnceCell, mpsc};
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// How long a finished stream keeps absorbing straggler frames.
const SESSION_GRACE: Duration = Duration::from_secs(10);

/// Construction-time configuration.
#[derive(Debug, Clone)]
pub struct StreamExecutorOptions {
    /// Request topic pattern; doubles as the subscription filter.
    pub request_pattern: String,
    /// Constant token bindings.
    pub topic_tokens: HashMap<String, String>,
}

impl StreamExecutorOptions {
    pub fn new(request_pattern: impl Into<String>) -> Self {
        StreamExecutorOptions {
            request_pattern: request_pattern.into(),
            topic_tokens: HashMap::new(),
        }
    }
}

/// An opened request stream as seen by the user handler.
pub struct StreamRequest<Req> {
    /// Request frames in receipt order; ends when the invoker sends its
    /// terminator.
    pub frames: UnboundedReceiverStream<Req>,
    /// The invoker's client id.
    pub source_id: String,
    /// User data from the opening frame.
    pub user_data: Vec<(String, String)>,
    /// Opening frame's clock stamp, already merged.
    pub timestamp: Option<HybridLogicalClock>,
    /// Concrete topic the stream arrived on.
    pub topic: String,
    /// Token values extracted from the topic.
    pub topic_tokens: HashMap<String, String>,
    /// Fires on cancellation, deadline expiry, or envoy shutdown.
    pub cancellation: CancellationToken,
}

/// The handler's output: response payloads, or a failure message that ends
/// the stream with an `ExecutorError` frame.
pub type StreamOutput<Resp> =
    Pin<Box<dyn Stream<Item = std::result::Result<Resp, String>> + Send>>;

type StreamHandler<Req, Resp> =
    Arc<dyn Fn(StreamRequest<Req>) -> StreamOutput<Resp> + Send + Sync>;

struct Session<Req> {
    input: Option<mpsc::UnboundedSender<Req>>,
    /// Handler-visible token; firing it makes the output pump confirm with a
    /// final `Cancelled` frame.
    cancellation: CancellationToken,
    /// Silent stop: the output pump exits without publishing anything more.
    /// Used when the invoker is already gone or this side sent the cancel
    /// frame itself.
    halt: CancellationToken,
    response_topic: String,
}

struct SessionTable<Req> {
    active: HashMap<Fingerprint, Session<Req>>,
    /// Finished fingerprints still inside their grace window.
    retired: Vec<(Instant, Fingerprint)>,
}

impl<Req> SessionTable<Req> {
    fn sweep(&mut self) {
        let now = Instant::now();
        self.retired.retain(|(until, _)| *until > now);
    }

    fn retire(&mut self, fingerprint: &Fingerprint) {
        self.active.remove(fingerprint);
        self.retired.push((Instant::now() + SESSION_GRACE, fingerprint.clone()));
    }

    fn in_grace(&self, fingerprint: &Fingerprint) -> bool {
        self.retired.iter().any(|(_, f)| f == fingerprint)
    }
}

struct StreamExecutorInner<Req, Resp> {
    client: Arc<dyn MqttClient>,
    clock: SharedClock,
    pattern: TopicPattern,
    handler: StreamHandler<Req, Resp>,
    sessions: Mutex<SessionTable<Req>>,
    shutdown: CancellationToken,
}

/// Stream executor envoy; see the module docs.
pub struct StreamExecutor<Req, Resp> {
    inner: Arc<StreamExecutorInner<Req, Resp>>,
    filter: String,
    started: OnceCell<()>,
}

impl<Req, Resp> StreamExecutor<Req, Resp>
where
    Req: PayloadCodec,
    Resp: PayloadCodec,
{
    /// Build a stream executor around `handler`.
    pub fn new<H>(
        client: Arc<dyn MqttClient>,
        clock: SharedClock,
        options: StreamExecutorOptions,
        handler: H,
    ) -> Result<Self>
    where
        H: Fn(StreamRequest<Req>) -> StreamOutput<Resp> + Send + Sync + 'static,
    {
        require_mqtt_v5(client.as_ref())?;
        let pattern = TopicPattern::new(&options.request_pattern, options.topic_tokens)?;
        let filter = pattern.subscribe_filter();
        Ok(StreamExecutor {
            inner: Arc::new(StreamExecutorInner {
                client,
                clock,
                pattern,
                handler: Arc::new(handler),
                sessions: Mutex::new(SessionTable { active: HashMap::new(), retired: Vec::new() }),
                shutdown: CancellationToken::new(),
            }),
            filter,
            started: OnceCell::new(),
        })
    }

    /// Subscribe and start dispatching.  Idempotent.
    pub async fn start(&self) -> Result<()> {
        self.started
            .get_or_try_init(|| async {
                self.inner
                    .client
                    .subscribe(&self.filter, QoS::AtLeastOnce)
                    .await
                    .map_err(Error::from)?;
                let messages = self.inner.client.filtered_messages(&self.filter);
                tokio::spawn(dispatch_loop(Arc::clone(&self.inner), messages));
                Ok(())
            })
            .await
            .copied()
    }

    /// Stop dispatching and cancel every open stream.
    ///
    /// Each open stream's invoker is told to stop with a cancel frame on the
    /// response topic before dispatch is torn down; the invoker's `Cancelled`
    /// confirmation then lands inside the session's grace window.
    pub async fn shutdown(&self) {
        let open: Vec<(Fingerprint, String, CancellationToken)> = {
            let mut sessions = lock(&self.inner.sessions);
            let open = sessions
                .active
                .iter()
                .map(|(f, s)| (f.clone(), s.response_topic.clone(), s.halt.clone()))
                .collect();
            for fingerprint in
                sessions.active.keys().cloned().collect::<Vec<_>>()
            {
                sessions.retire(&fingerprint);
            }
            open
        };
        for (fingerprint, response_topic, halt) in open {
            publish_cancel(&self.inner, &response_topic, fingerprint.correlation_id).await;
            halt.cancel();
        }
        self.inner.shutdown.cancel();
        if self.started.get().is_some() {
            if let Err(e) = self.inner.client.unsubscribe(&self.filter).await {
                debug!(error = %e, filter = %self.filter, "unsubscribe on shutdown");
            }
        }
    }
}

impl<Req, Resp> Drop for StreamExecutor<Req, Resp> {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

async fn dispatch_loop<Req, Resp>(
    inner: Arc<StreamExecutorInner<Req, Resp>>,
    mut messages: mpsc::UnboundedReceiver<InboundMessage>,
) where
    Req: PayloadCodec,
    Resp: PayloadCodec,
{
    loop {
        tokio::select! {
            biased;
            () = inner.shutdown.cancelled() => break,
            inbound = messages.recv() => {
                let Some(mut inbound) = inbound else { break };
                // Ack on receipt: a slow stream must never block the client.
                if let Some(ack) = inbound.take_ack() {
                    ack.ack();
                }
                // Frames are handled inline to preserve receipt order on the
                // handler's input.
                handle_frame(&inner, inbound.message).await;
            }
        }
    }
}

async fn handle_frame<Req, Resp>(inner: &Arc<StreamExecutorInner<Req, Resp>>, request: Envelope)
where
    Req: PayloadCodec,
    Resp: PayloadCodec,
{
    let meta = match InboundMeta::parse(&request.user_properties) {
        Ok(meta) => meta,
        Err(e) => {
            warn!(error = %e, topic = %request.topic, "malformed stream frame dropped");
            return;
        }
    };
    let Some(correlation_id) =
        request.correlation_data.as_deref().and_then(correlation_uuid)
    else {
        warn!(topic = %request.topic, "stream frame without usable correlation data dropped");
        return;
    };
    let Some(kind) = classify(&meta, request.payload.is_empty()) else {
        warn!(topic = %request.topic, "request without stream header dropped");
        return;
    };
    let Some(source_id) = meta.source_id.clone() else {
        if let Some(response_topic) = request.response_topic.clone() {
            let detail = AppErrorDetail {
                message: Some("stream frame carries no source id".to_owned()),
                supported_major_versions: None,
                property_name: Some(PROP_SOURCE_ID.to_owned()),
            };
            publish_final(inner, &response_topic, correlation_id, 0, codes::HEADER_MISSING, detail)
                .await;
        }
        return;
    };
    let fingerprint = Fingerprint { source_id: source_id.clone(), correlation_id };

    {
        let mut sessions = lock(&inner.sessions);
        sessions.sweep();
        if sessions.in_grace(&fingerprint) {
            debug!(%correlation_id, "straggler frame inside grace window discarded");
            return;
        }
    }

    if let FrameKind::Cancel = kind {
        // Cancellation: stop the handler; its output task confirms with the
        // final Cancelled frame and retires the session.
        let cancelled = {
            let sessions = lock(&inner.sessions);
            sessions.active.get(&fingerprint).map(|s| s.cancellation.clone())
        };
        match cancelled {
            Some(token) => token.cancel(),
            None => debug!(%correlation_id, "cancel for unknown stream ignored"),
        }
        return;
    }

    if meta.require_version(SUPPORTED_STREAM_MAJORS).is_err() {
        if let Some(response_topic) = request.response_topic.clone() {
            let detail = AppErrorDetail {
                message: Some(format!("protocol version {} not supported", meta.version)),
                supported_major_versions: Some(SUPPORTED_STREAM_MAJORS.to_vec()),
                property_name: None,
            };
            publish_final(
                inner,
                &response_topic,
                correlation_id,
                0,
                codes::UNSUPPORTED_VERSION,
                detail,
            )
            .await;
        }
        return;
    }

    if let Some(stamp) = &meta.timestamp {
        if let Err(e) = inner.clock.observe(stamp) {
            warn!(error = %e, %correlation_id, "stream frame clock stamp rejected; frame dropped");
            return;
        }
    }

    match kind {
        FrameKind::Cancel => unreachable!("handled above"),
        FrameKind::Failure(failure) => {
            // The invoker ended its side with an error (e.g. the Cancelled
            // confirmation); stop the handler and close quietly, publishing
            // nothing to an invoker that is already gone.
            let tokens = {
                let mut sessions = lock(&inner.sessions);
                let tokens = sessions
                    .active
                    .get(&fingerprint)
                    .map(|s| (s.cancellation.clone(), s.halt.clone()));
                if tokens.is_some() {
                    sessions.retire(&fingerprint);
                }
                tokens
            };
            if let Some((cancellation, halt)) = tokens {
                debug!(%correlation_id, code = %failure.code, "stream closed by invoker");
                halt.cancel();
                cancellation.cancel();
            }
        }
        FrameKind::Terminator(_) => {
            let mut sessions = lock(&inner.sessions);
            match sessions.active.get_mut(&fingerprint) {
                Some(session) => {
                    // Close the handler's input; the session retires when the
                    // output side finishes.
                    session.input = None;
                }
                None => {
                    // A last frame may never open a stream.
                    warn!(%correlation_id, "terminator with no prior data frame discarded");
                }
            }
        }
        FrameKind::Data(frame) => {
            handle_data_frame(inner, request, meta, frame, fingerprint, source_id).await;
        }
    }
}

async fn handle_data_frame<Req, Resp>(
    inner: &Arc<StreamExecutorInner<Req, Resp>>,
    request: Envelope,
    meta: InboundMeta,
    frame: StreamFrame,
    fingerprint: Fingerprint,
    source_id: String,
) where
    Req: PayloadCodec,
    Resp: PayloadCodec,
{
    let Some(response_topic) = request.response_topic.clone() else {
        warn!(topic = %request.topic, "stream frame without response topic dropped");
        return;
    };
    let payload = match Req::decode(
        &request.payload,
        request.content_type.as_deref(),
        request.format_indicator,
    ) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "request frame failed to decode; failing stream");
            let tokens = {
                let mut sessions = lock(&inner.sessions);
                let tokens = sessions
                    .active
                    .get(&fingerprint)
                    .map(|s| (s.cancellation.clone(), s.halt.clone()));
                if tokens.is_some() {
                    sessions.retire(&fingerprint);
                }
                tokens
            };
            if let Some((cancellation, halt)) = tokens {
                // The explicit error frame below is the stream's only close.
                halt.cancel();
                cancellation.cancel();
            }
            publish_final(
                inner,
                &response_topic,
                fingerprint.correlation_id,
                0,
                codes::PAYLOAD_INVALID,
                AppErrorDetail::message(e.to_string()),
            )
            .await;
            return;
        }
    };

    let exists = {
        let sessions = lock(&inner.sessions);
        sessions.active.contains_key(&fingerprint)
    };
    if !exists {
        // First frame: open the session and invoke the handler.
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let cancellation = inner.shutdown.child_token();
        let halt = CancellationToken::new();
        let topic_tokens = inner.pattern.match_topic(&request.topic).unwrap_or_default();
        let opened = StreamRequest {
            frames: UnboundedReceiverStream::new(input_rx),
            source_id,
            user_data: meta.user_data,
            timestamp: meta.timestamp,
            topic: request.topic.clone(),
            topic_tokens,
            cancellation: cancellation.clone(),
        };
        let output = (inner.handler)(opened);
        {
            let mut sessions = lock(&inner.sessions);
            sessions.active.insert(
                fingerprint.clone(),
                Session {
                    input: Some(input_tx.clone()),
                    cancellation: cancellation.clone(),
                    halt: halt.clone(),
                    response_topic: response_topic.clone(),
                },
            );
        }
        let deadline = frame.timeout_ms.map(Duration::from_millis);
        tokio::spawn(pump_output(
            Arc::clone(inner),
            fingerprint.clone(),
            response_topic,
            output,
            cancellation,
            halt,
            deadline,
        ));
        let _ = input_tx.send(payload);
        if frame.is_last {
            let mut sessions = lock(&inner.sessions);
            if let Some(session) = sessions.active.get_mut(&fingerprint) {
                session.input = None;
            }
        }
    } else {
        let mut sessions = lock(&inner.sessions);
        if let Some(session) = sessions.active.get_mut(&fingerprint) {
            if let Some(input) = &session.input {
                let _ = input.send(payload);
            } else {
                debug!(correlation_id = %fingerprint.correlation_id, "frame after terminator discarded");
            }
            if frame.is_last {
                session.input = None;
            }
        }
    }
}

/// Publish the handler's output frames, then the closing frame.  Exactly one
/// closing frame leaves this task: a terminator, or a final error frame on
/// failure, cancellation, or deadline expiry.
async fn pump_output<Req, Resp>(
    inner: Arc<StreamExecutorInner<Req, Resp>>,
    fingerprint: Fingerprint,
    response_topic: String,
    mut output: StreamOutput<Resp>,
    cancellation: CancellationToken,
    halt: CancellationToken,
    deadline: Option<Duration>,
) where
    Req: PayloadCodec,
    Resp: PayloadCodec,
{
    let mut phase = StreamPhase::Active;
    let mut index = 0u64;
    let expiry = async {
        match deadline {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(expiry);

    loop {
        tokio::select! {
            biased;
            // Silent stop wins over the confirming cancel when both fire.
            () = halt.cancelled() => {
                phase = phase.cancel().finish();
                break;
            }
            () = cancellation.cancelled() => {
                phase = phase.cancel();
                publish_final(
                    &inner,
                    &response_topic,
                    fingerprint.correlation_id,
                    index,
                    codes::CANCELLED,
                    AppErrorDetail::message("stream cancelled"),
                )
                .await;
                phase = phase.finish();
                break;
            }
            () = &mut expiry => {
                phase = phase.expire();
                publish_final(
                    &inner,
                    &response_topic,
                    fingerprint.correlation_id,
                    index,
                    codes::TIMEOUT,
                    AppErrorDetail::message("stream deadline elapsed"),
                )
                .await;
                break;
            }
            item = output.next() => match item {
                Some(Ok(payload)) => {
                    match publish_data(&inner, &response_topic, &fingerprint, index, payload).await {
                        Ok(()) => index += 1,
                        Err(e) => {
                            warn!(error = %e, "response frame publish failed; failing stream");
                            publish_final(
                                &inner,
                                &response_topic,
                                fingerprint.correlation_id,
                                index,
                                codes::EXECUTOR_ERROR,
                                AppErrorDetail::message(e.message.clone()),
                            )
                            .await;
                            break;
                        }
                    }
                }
                Some(Err(message)) => {
                    publish_final(
                        &inner,
                        &response_topic,
                        fingerprint.correlation_id,
                        index,
                        codes::EXECUTOR_ERROR,
                        AppErrorDetail::message(message),
                    )
                    .await;
                    phase = phase.finish();
                    break;
                }
                None => {
                    publish_terminator(&inner, &response_topic, &fingerprint, index).await;
                    phase = phase.finish();
                    break;
                }
            }
        }
    }

    {
        let mut sessions = lock(&inner.sessions);
        sessions.retire(&fingerprint);
    }
    debug!(correlation_id = %fingerprint.correlation_id, ?phase, "stream session finished");
}

async fn publish_data<Req, Resp>(
    inner: &Arc<StreamExecutorInner<Req, Resp>>,
    response_topic: &str,
    fingerprint: &Fingerprint,
    index: u64,
    payload: Resp,
) -> Result<()>
where
    Req: PayloadCodec,
    Resp: PayloadCodec,
{
    let encoded = payload
        .encode()
        .map_err(|e| Error::new(ErrorKind::PayloadInvalid, e.to_string()))?;
    let stamp = inner.clock.stamp()?;
    let user_properties = OutboundMeta {
        source_id: inner.client.client_id(),
        timestamp: Some(&stamp),
        version: STREAM_VERSION,
        stream: Some(StreamFrame::response(index, false)),
        app_error: None,
        user_data: &[],
    }
    .into_properties()?;
    let envelope = Envelope {
        topic: response_topic.to_owned(),
        payload: encoded.bytes,
        qos: QoS::AtLeastOnce,
        retain: false,
        content_type: encoded.content_type,
        format_indicator: encoded.format_indicator,
        correlation_data: Some(bytes_of(fingerprint.correlation_id)),
        response_topic: None,
        message_expiry: None,
        user_properties,
    };
    inner.client.publish(envelope).await.map_err(Error::from)
}

async fn publish_terminator<Req, Resp>(
    inner: &Arc<StreamExecutorInner<Req, Resp>>,
    response_topic: &str,
    fingerprint: &Fingerprint,
    index: u64,
) {
    let stamp = inner.clock.stamp().ok();
    let user_properties = OutboundMeta {
        source_id: inner.client.client_id(),
        timestamp: stamp.as_ref(),
        version: STREAM_VERSION,
        stream: Some(StreamFrame::response(index, true)),
        app_error: None,
        user_data: &[],
    }
    .into_properties();
    let Ok(user_properties) = user_properties else { return };
    let envelope = Envelope {
        topic: response_topic.to_owned(),
        qos: QoS::AtLeastOnce,
        correlation_data: Some(bytes_of(fingerprint.correlation_id)),
        user_properties,
        ..Envelope::default()
    };
    if let Err(e) = inner.client.publish(envelope).await {
        warn!(error = %e, "stream terminator publish failed");
    }
}

/// Executor-initiated cancellation: the `(0,1,1,0)` cancel frame crosses in
/// the response direction so the invoker stops producing immediately instead
/// of riding out its deadline.
async fn publish_cancel<Req, Resp>(
    inner: &Arc<StreamExecutorInner<Req, Resp>>,
    response_topic: &str,
    correlation_id: Uuid,
) {
    let user_properties = OutboundMeta {
        source_id: inner.client.client_id(),
        timestamp: None,
        version: STREAM_VERSION,
        stream: Some(StreamFrame::cancellation()),
        app_error: None,
        user_data: &[],
    }
    .into_properties();
    let Ok(user_properties) = user_properties else { return };
    let envelope = Envelope {
        topic: response_topic.to_owned(),
        qos: QoS::AtLeastOnce,
        correlation_data: Some(bytes_of(correlation_id)),
        message_expiry: Some(Duration::from_secs(10)),
        user_properties,
        ..Envelope::default()
    };
    if let Err(e) = inner.client.publish(envelope).await {
        warn!(error = %e, topic = %response_topic, "stream cancel publish failed");
    }
}

async fn publish_final<Req, Resp>(
    inner: &Arc<StreamExecutorInner<Req, Resp>>,
    response_topic: &str,
    correlation_id: Uuid,
    index: u64,
    code: &'static str,
    detail: AppErrorDetail,
) {
    let stamp = inner.clock.stamp().ok();
    let user_properties = OutboundMeta {
        source_id: inner.client.client_id(),
        timestamp: stamp.as_ref(),
        version: STREAM_VERSION,
        stream: Some(StreamFrame::response(index, true)),
        app_error: Some((code, detail)),
        user_data: &[],
    }
    .into_properties();
    let Ok(user_properties) = user_properties else { return };
    let envelope = Envelope {
        topic: response_topic.to_owned(),
        qos: QoS::AtLeastOnce,
        correlation_data: Some(bytes_of(correlation_id)),
        user_properties,
        ..Envelope::default()
    };
    if let Err(e) = inner.client.publish(envelope).await {
        warn!(error = %e, "final stream frame publish failed");
    }
}

fn bytes_of(id: Uuid) -> bytes::Bytes {
    bytes::Bytes::copy_from_slice(id.as_bytes())
}

fn lock<Req>(sessions: &Mutex<SessionTable<Req>>) -> std::sync::MutexGuard<'_, SessionTable<Req>> {
    match sessions.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
