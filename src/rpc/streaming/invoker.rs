//! Invoker side of streamed RPC.
//!
//! `invoke` pumps the caller's request stream onto the wire frame by frame
//! (each carrying the stream deadline), closes the request direction with an
//! empty terminator, and returns a [`ResponseStream`] yielding response
//! frames in receipt order.  The deadline countdown starts when the broker
//! acknowledges the first request frame.

use crate::error::{Error, ErrorKind, Result};
use crate::hlc::{HybridLogicalClock, SharedClock};
use crate::meta::{InboundMeta, OutboundMeta};
use crate::mqtt::{Envelope, MqttClient, QoS, require_mqtt_v5};
use crate::payload::PayloadCodec;
use crate::rpc::correlation::{CorrelationRegistry, response_dispatch_loop};
use crate::rpc::expiry_interval;
use crate::rpc::streaming::{FrameKind, StreamPhase, classify};
use crate::topic::TopicPattern;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use mqrt_protocol::{AppErrorDetail, STREAM_VERSION, SUPPORTED_STREAM_MAJORS, StreamFrame, codes};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{OnceCell, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Construction-time configuration.
#[derive(Debug, Clone)]
pub struct StreamInvokerOptions {
    /// Request topic pattern for the streamed command.
    pub request_pattern: String,
    /// Constant token bindings.
    pub topic_tokens: HashMap<String, String>,
    /// Response-topic ownership prefix; `clients/{clientId}` when `None`.
    pub response_topic_prefix: Option<String>,
}

/// Per-invocation configuration.
#[derive(Debug, Clone)]
pub struct StreamInvokeOptions {
    /// Stream deadline, repeated in every request frame.
    pub timeout: Duration,
    /// Transient token bindings.
    pub topic_tokens: HashMap<String, String>,
    /// Caller metadata attached to every data frame.
    pub user_data: Vec<(String, String)>,
}

impl Default for StreamInvokeOptions {
    fn default() -> Self {
        StreamInvokeOptions {
            timeout: Duration::from_secs(30),
            topic_tokens: HashMap::new(),
            user_data: Vec::new(),
        }
    }
}

/// One response frame, in receipt order.
#[derive(Debug)]
pub struct StreamResponse<Resp> {
    pub payload: Resp,
    /// Sender-assigned index; informational only.
    pub index: u64,
    pub timestamp: Option<HybridLogicalClock>,
    pub user_data: Vec<(String, String)>,
}

/// Stream invoker envoy; see the module docs.
pub struct StreamInvoker<Req, Resp> {
    client: Arc<dyn MqttClient>,
    clock: SharedClock,
    pattern: TopicPattern,
    response_prefix: String,
    response_filter: String,
    registry: Arc<CorrelationRegistry>,
    started: OnceCell<()>,
    shutdown: CancellationToken,
    _request: std::marker::PhantomData<fn(Req)>,
    _response: std::marker::PhantomData<fn() -> Resp>,
}

impl<Req, Resp> StreamInvoker<Req, Resp>
where
    Req: PayloadCodec,
    Resp: PayloadCodec,
{
    pub fn new(
        client: Arc<dyn MqttClient>,
        clock: SharedClock,
        options: StreamInvokerOptions,
    ) -> Result<Self> {
        require_mqtt_v5(client.as_ref())?;
        let pattern = TopicPattern::new(&options.request_pattern, options.topic_tokens)?;
        let response_prefix = match options.response_topic_prefix {
            Some(prefix) => {
                if !crate::topic::valid_replacement(&prefix) {
                    return Err(Error::shallow(
                        ErrorKind::ConfigurationInvalid,
                        format!("invalid response topic prefix {prefix:?}"),
                    ));
                }
                prefix
            }
            None => format!("clients/{}", client.client_id()),
        };
        let response_filter = format!("{response_prefix}/{}", pattern.subscribe_filter());
        Ok(StreamInvoker {
            client,
            clock,
            pattern,
            response_prefix,
            response_filter,
            registry: Arc::new(CorrelationRegistry::new()),
            started: OnceCell::new(),
            shutdown: CancellationToken::new(),
            _request: std::marker::PhantomData,
            _response: std::marker::PhantomData,
        })
    }

    /// Open a streamed invocation.
    ///
    /// Request frames are published as `requests` yields them; the returned
    /// stream yields response frames until the executor closes the stream,
    /// the deadline elapses, or either side cancels.
    pub async fn invoke<S>(
        &self,
        requests: S,
        options: StreamInvokeOptions,
    ) -> Result<ResponseStream<Resp>>
    where
        S: Stream<Item = Req> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(Error::shallow(ErrorKind::Disposed, "stream invoker is disposed"));
        }
        let expiry = expiry_interval(options.timeout, None)?;
        self.ensure_started().await?;

        let topic = self.pattern.publish_topic(&options.topic_tokens)?;
        let response_topic = format!("{}/{topic}", self.response_prefix);
        let correlation_id = Uuid::new_v4();
        let raw = self.registry.register_stream(correlation_id)?;

        let shared = Arc::new(StreamShared {
            client: Arc::clone(&self.client),
            registry: Arc::clone(&self.registry),
            request_topic: topic,
            correlation_id,
            source_id: self.client.client_id().to_owned(),
            cancelled: AtomicBool::new(false),
            halt_requests: CancellationToken::new(),
        });

        let (first_ack_tx, first_ack_rx) = oneshot::channel();
        tokio::spawn(pump_requests::<Req>(
            Arc::clone(&shared),
            Box::pin(requests),
            RequestPumpConfig {
                clock: self.clock.clone(),
                response_topic,
                timeout_ms: u64::try_from(options.timeout.as_millis()).unwrap_or(u64::MAX),
                expiry,
                user_data: options.user_data,
            },
            first_ack_tx,
        ));

        let (items_tx, items_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_responses::<Resp>(
            Arc::clone(&shared),
            self.clock.clone(),
            raw,
            items_tx,
            first_ack_rx,
            options.timeout,
        ));

        Ok(ResponseStream { items: items_rx, shared })
    }

    async fn ensure_started(&self) -> Result<()> {
        self.started
            .get_or_try_init(|| async {
                self.client
                    .subscribe(&self.response_filter, QoS::AtLeastOnce)
                    .await
                    .map_err(Error::from)?;
                let messages = self.client.filtered_messages(&self.response_filter);
                let connection = self.client.connection_state();
                tokio::spawn(response_dispatch_loop(
                    messages,
                    connection,
                    Arc::clone(&self.registry),
                    self.shutdown.clone(),
                ));
                Ok(())
            })
            .await
            .copied()
    }

    /// Dispose the envoy: open streams complete with `Disposed`.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.registry.fail_all(ErrorKind::Disposed, "stream invoker disposed");
        if self.started.get().is_some() {
            if let Err(e) = self.client.unsubscribe(&self.response_filter).await {
                debug!(error = %e, filter = %self.response_filter, "unsubscribe on shutdown");
            }
        }
    }
}

impl<Req, Resp> Drop for StreamInvoker<Req, Resp> {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.registry.fail_all(ErrorKind::Disposed, "stream invoker disposed");
    }
}

/// State shared between the two pump tasks and the consumer handle.
struct StreamShared {
    client: Arc<dyn MqttClient>,
    registry: Arc<CorrelationRegistry>,
    request_topic: String,
    correlation_id: Uuid,
    source_id: String,
    cancelled: AtomicBool,
    /// Stops the request pump early (local cancel or inbound cancel frame).
    halt_requests: CancellationToken,
}

impl StreamShared {
    /// Publish a control frame (cancel, or a final error frame) on the
    /// request topic.  Best-effort.
    async fn publish_control(&self, frame: StreamFrame, app_error: Option<(&'static str, AppErrorDetail)>) {
        let user_properties = OutboundMeta {
            source_id: &self.source_id,
            timestamp: None,
            version: STREAM_VERSION,
            stream: Some(frame),
            app_error,
            user_data: &[],
        }
        .into_properties();
        let Ok(user_properties) = user_properties else { return };
        let envelope = Envelope {
            topic: self.request_topic.clone(),
            qos: QoS::AtLeastOnce,
            correlation_data: Some(Bytes::copy_from_slice(self.correlation_id.as_bytes())),
            message_expiry: Some(Duration::from_secs(10)),
            user_properties,
            ..Envelope::default()
        };
        if let Err(e) = self.client.publish(envelope).await {
            debug!(error = %e, "stream control publish failed");
        }
    }
}

struct RequestPumpConfig {
    clock: SharedClock,
    response_topic: String,
    timeout_ms: u64,
    expiry: Duration,
    user_data: Vec<(String, String)>,
}

/// Publish the caller's request frames, then the empty terminator.
async fn pump_requests<Req>(
    shared: Arc<StreamShared>,
    mut requests: Pin<Box<dyn Stream<Item = Req> + Send>>,
    config: RequestPumpConfig,
    first_ack: oneshot::Sender<()>,
) where
    Req: PayloadCodec,
{
    let mut first_ack = Some(first_ack);
    let mut index = 0u64;
    loop {
        let item = tokio::select! {
            biased;
            () = shared.halt_requests.cancelled() => break,
            item = requests.next() => item,
        };
        let Some(item) = item else { break };
        let encoded = match item.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(error = %e, "request frame failed to encode; aborting stream");
                shared.registry.fail_entry(
                    shared.correlation_id,
                    Error::shallow(ErrorKind::PayloadInvalid, e.to_string()),
                );
                return;
            }
        };
        let stamp = match config.clock.stamp() {
            Ok(stamp) => stamp,
            Err(e) => {
                shared.registry.fail_entry(shared.correlation_id, e);
                return;
            }
        };
        let frame = StreamFrame::request(index, config.timeout_ms);
        let user_properties = OutboundMeta {
            source_id: &shared.source_id,
            timestamp: Some(&stamp),
            version: STREAM_VERSION,
            stream: Some(frame),
            app_error: None,
            user_data: &config.user_data,
        }
        .into_properties();
        let user_properties = match user_properties {
            Ok(props) => props,
            Err(e) => {
                shared.registry.fail_entry(shared.correlation_id, e);
                return;
            }
        };
        let envelope = Envelope {
            topic: shared.request_topic.clone(),
            payload: encoded.bytes,
            qos: QoS::AtLeastOnce,
            retain: false,
            content_type: encoded.content_type,
            format_indicator: encoded.format_indicator,
            correlation_data: Some(Bytes::copy_from_slice(shared.correlation_id.as_bytes())),
            response_topic: Some(config.response_topic.clone()),
            message_expiry: Some(config.expiry),
            user_properties,
        };
        if let Err(e) = shared.client.publish(envelope).await {
            shared.registry.fail_entry(shared.correlation_id, e.into());
            return;
        }
        // The deadline countdown starts at the first publish ack.
        if let Some(tx) = first_ack.take() {
            let _ = tx.send(());
        }
        index += 1;
    }

    if shared.halt_requests.is_cancelled() {
        return;
    }
    // Terminator: one past the last data index, no payload, protocol
    // properties only.
    let terminator = StreamFrame::request_terminator(index, config.timeout_ms);
    let user_properties = OutboundMeta {
        source_id: &shared.source_id,
        timestamp: None,
        version: STREAM_VERSION,
        stream: Some(terminator),
        app_error: None,
        user_data: &[],
    }
    .into_properties();
    if let Ok(user_properties) = user_properties {
        let envelope = Envelope {
            topic: shared.request_topic.clone(),
            qos: QoS::AtLeastOnce,
            correlation_data: Some(Bytes::copy_from_slice(shared.correlation_id.as_bytes())),
            response_topic: Some(config.response_topic),
            message_expiry: Some(config.expiry),
            user_properties,
            ..Envelope::default()
        };
        match shared.client.publish(envelope).await {
            Ok(()) => {
                // An empty request stream still arms the deadline here.
                if let Some(tx) = first_ack.take() {
                    let _ = tx.send(());
                }
            }
            Err(e) => debug!(error = %e, "stream terminator publish failed"),
        }
    }
}

/// Decode raw response-topic envelopes into consumer items.
async fn pump_responses<Resp>(
    shared: Arc<StreamShared>,
    clock: SharedClock,
    mut raw: mpsc::UnboundedReceiver<Result<Envelope>>,
    items: mpsc::UnboundedSender<Result<StreamResponse<Resp>>>,
    first_ack: oneshot::Receiver<()>,
    timeout: Duration,
) where
    Resp: PayloadCodec,
{
    let mut phase = StreamPhase::Idle;
    let mut seen_data = false;

    // Arm the deadline only once the first request frame is acked.
    let deadline = async move {
        if first_ack.await.is_ok() {
            tokio::time::sleep(timeout).await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(deadline);

    loop {
        let outcome = tokio::select! {
            () = &mut deadline => {
                phase = phase.expire();
                let _ = items.send(Err(Error::new(
                    ErrorKind::Timeout,
                    format!("stream timed out after {timeout:?}"),
                )));
                shared.halt_requests.cancel();
                shared.registry.retire_entry(shared.correlation_id);
                break;
            }
            outcome = raw.recv() => outcome,
        };
        let envelope = match outcome {
            Some(Ok(envelope)) => envelope,
            Some(Err(e)) => {
                // In-band failure: cancellation, disposal, connection loss.
                phase = phase.finish();
                let _ = items.send(Err(e));
                shared.halt_requests.cancel();
                break;
            }
            None => break,
        };
        let meta = match InboundMeta::parse(&envelope.user_properties) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(error = %e, "malformed stream frame dropped");
                continue;
            }
        };
        if meta.require_version(SUPPORTED_STREAM_MAJORS).is_err() {
            warn!(version = %meta.version, "stream frame with unsupported version dropped");
            continue;
        }
        if let Some(stamp) = &meta.timestamp {
            if let Err(e) = clock.observe(stamp) {
                warn!(error = %e, "stream frame clock stamp rejected; frame dropped");
                continue;
            }
        }
        match classify(&meta, envelope.payload.is_empty()) {
            Some(FrameKind::Cancel) => {
                // Executor asked us to stop: halt production, confirm with a
                // final Cancelled frame, and end the consumer stream.
                phase = phase.cancel();
                shared.halt_requests.cancel();
                shared
                    .publish_control(
                        StreamFrame::response(0, true),
                        Some((codes::CANCELLED, AppErrorDetail::message("stream cancelled"))),
                    )
                    .await;
                let _ = items.send(Err(Error::new(
                    ErrorKind::Cancelled,
                    "stream cancelled by executor",
                )
                .remote()));
                phase = phase.finish();
                shared.registry.retire_entry(shared.correlation_id);
                break;
            }
            Some(FrameKind::Failure(failure)) => {
                phase = phase.finish();
                let _ = items.send(Err(failure.into_error()));
                shared.halt_requests.cancel();
                shared.registry.retire_entry(shared.correlation_id);
                break;
            }
            Some(FrameKind::Terminator(_)) if !seen_data => {
                // A stream must carry at least one data frame before its
                // terminator.
                warn!(correlation_id = %shared.correlation_id, "terminator with no prior data frame discarded");
            }
            Some(FrameKind::Terminator(_)) => {
                phase = phase.finish();
                shared.registry.retire_entry(shared.correlation_id);
                break;
            }
            Some(FrameKind::Data(frame)) => {
                phase = phase.first_frame();
                match Resp::decode(
                    &envelope.payload,
                    envelope.content_type.as_deref(),
                    envelope.format_indicator,
                ) {
                    Ok(payload) => {
                        seen_data = true;
                        let delivered = items.send(Ok(StreamResponse {
                            payload,
                            index: frame.index,
                            timestamp: meta.timestamp,
                            user_data: meta.user_data,
                        }));
                        if delivered.is_err() {
                            // Consumer dropped the stream without cancelling.
                            shared.halt_requests.cancel();
                            shared.registry.retire_entry(shared.correlation_id);
                            break;
                        }
                        if frame.is_last {
                            phase = phase.finish();
                            shared.registry.retire_entry(shared.correlation_id);
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "response frame failed to decode; frame dropped");
                    }
                }
            }
            None => {
                warn!(topic = %envelope.topic, "response without stream header dropped");
            }
        }
    }
    debug!(correlation_id = %shared.correlation_id, ?phase, "stream consumer pump finished");
}

/// Consumable sequence of response frames with an out-of-band cancel.
pub struct ResponseStream<Resp> {
    items: mpsc::UnboundedReceiver<Result<StreamResponse<Resp>>>,
    shared: Arc<StreamShared>,
}

impl<Resp> ResponseStream<Resp> {
    /// Cancel the invocation: publish the cancel frame on the request topic
    /// and resolve the consumer with `Cancelled` without waiting for the
    /// executor.  Late frames are acked and discarded for the grace period.
    pub async fn cancel(&self) {
        if self.shared.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.halt_requests.cancel();
        self.shared
            .publish_control(StreamFrame::cancellation(), None)
            .await;
        self.shared.registry.fail_entry(
            self.shared.correlation_id,
            Error::new(ErrorKind::Cancelled, "stream cancelled by caller"),
        );
    }

    /// Receive the next item.
    pub async fn recv(&mut self) -> Option<Result<StreamResponse<Resp>>> {
        self.items.recv().await
    }
}

impl<Resp> Stream for ResponseStream<Resp> {
    type Item = Result<StreamResponse<Resp>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.items.poll_recv(cx)
    }
}

impl<Resp> Drop for ResponseStream<Resp> {
    fn drop(&mut self) {
        // Consumer went away: stop producing and retire the entry; inbound
        // stragglers are acked and discarded by the dispatch loop.
        self.shared.halt_requests.cancel();
        self.shared.registry.retire_entry(self.shared.correlation_id);
    }
}
