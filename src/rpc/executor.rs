//! Command executor envoy.
//!
//! Subscribes once (QoS 1) to the request pattern and dispatches inbound
//! requests to the user handler, at most `dispatch_concurrency` at a time.
//! The request is acknowledged only after the response publish succeeds, so
//! broker redelivery replays unconfirmed work; the dedup cache then ensures
//! the handler still runs at most once per request fingerprint.

use crate::error::{Error, ErrorKind, Result};
use crate::hlc::{HybridLogicalClock, SharedClock};
use crate::meta::{InboundMeta, OutboundMeta};
use crate::mqtt::{AckToken, Envelope, InboundMessage, MqttClient, QoS, require_mqtt_v5};
use crate::payload::PayloadCodec;
use crate::rpc::cache::{Claim, DedupCache, Fingerprint, Retention, StoredResponse};
use crate::rpc::correlation_uuid;
use crate::topic::TopicPattern;
use mqrt_protocol::{AppErrorDetail, PROP_SOURCE_ID, RPC_VERSION, SUPPORTED_RPC_MAJORS};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Grace the handler gets to unwind after its cancellation token fires.
const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Construction-time configuration.
#[derive(Debug, Clone)]
pub struct CommandExecutorOptions {
    /// Request topic pattern; doubles as the subscription filter.
    pub request_pattern: String,
    /// Constant token bindings.
    pub topic_tokens: HashMap<String, String>,
    /// Idempotent commands release their outcome as soon as the handler
    /// completes, so a redelivery from then on may run the handler again.
    /// Non-idempotent commands hold the outcome until the response ack is
    /// confirmed, replaying it for duplicates that land in between.
    /// Concurrent duplicates coalesce either way.
    pub idempotent: bool,
    /// `Some(ttl)` keeps terminal outcomes for replay; `None` drops them as
    /// soon as the response ack is confirmed.
    pub cacheable_ttl: Option<Duration>,
    /// Bound on dedup entries before LRU eviction.
    pub cache_capacity: usize,
    /// Handlers running concurrently.
    pub dispatch_concurrency: usize,
}

impl CommandExecutorOptions {
    pub fn new(request_pattern: impl Into<String>) -> Self {
        CommandExecutorOptions {
            request_pattern: request_pattern.into(),
            topic_tokens: HashMap::new(),
            idempotent: false,
            cacheable_ttl: None,
            cache_capacity: 1024,
            dispatch_concurrency: 8,
        }
    }
}

/// An inbound request as seen by the user handler.
#[derive(Debug)]
pub struct CommandRequest<Req> {
    pub payload: Req,
    /// Non-reserved user properties, in wire order.
    pub user_data: Vec<(String, String)>,
    /// Invoker clock stamp, already merged into the process clock.
    pub timestamp: Option<HybridLogicalClock>,
    /// The invoker's client id (`__srcId`).
    pub source_id: String,
    /// Concrete topic the request arrived on.
    pub topic: String,
    /// Token values extracted from the topic.
    pub topic_tokens: HashMap<String, String>,
    /// Fires when the runtime needs the handler to stop (deadline or envoy
    /// shutdown).  Handlers should finish promptly once it does.
    pub cancellation: CancellationToken,
}

/// What the handler returns on success.
#[derive(Debug, Default)]
pub struct CommandReply<Resp> {
    pub payload: Resp,
    pub user_data: Vec<(String, String)>,
}

impl<Resp> CommandReply<Resp> {
    pub fn new(payload: Resp) -> Self {
        CommandReply { payload, user_data: Vec::new() }
    }
}

/// User handler: a failure message becomes an `ExecutorError` response.
pub type CommandHandler<Req, Resp> = Arc<
    dyn Fn(
            CommandRequest<Req>,
        )
            -> Pin<Box<dyn Future<Output = std::result::Result<CommandReply<Resp>, String>> + Send>>
        + Send
        + Sync,
>;

struct ExecutorInner<Req, Resp> {
    client: Arc<dyn MqttClient>,
    clock: SharedClock,
    pattern: TopicPattern,
    cache: DedupCache,
    handler: CommandHandler<Req, Resp>,
    cacheable: bool,
    idempotent: bool,
    shutdown: CancellationToken,
}

/// Command executor envoy; see the module docs.
pub struct CommandExecutor<Req, Resp> {
    inner: Arc<ExecutorInner<Req, Resp>>,
    filter: String,
    dispatch_concurrency: usize,
    started: OnceCell<()>,
}

impl<Req, Resp> CommandExecutor<Req, Resp>
where
    Req: PayloadCodec,
    Resp: PayloadCodec,
{
    /// Build an executor for `options.request_pattern` around `handler`.
    pub fn new<H, Fut>(
        client: Arc<dyn MqttClient>,
        clock: SharedClock,
        options: CommandExecutorOptions,
        handler: H,
    ) -> Result<Self>
    where
        H: Fn(CommandRequest<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<CommandReply<Resp>, String>> + Send + 'static,
    {
        require_mqtt_v5(client.as_ref())?;
        if options.dispatch_concurrency == 0 {
            return Err(Error::shallow(
                ErrorKind::ConfigurationInvalid,
                "dispatch concurrency must be at least 1",
            ));
        }
        let pattern = TopicPattern::new(&options.request_pattern, options.topic_tokens)?;
        let filter = pattern.subscribe_filter();
        let cache_ttl = options.cacheable_ttl.unwrap_or(Duration::ZERO);
        let handler: CommandHandler<Req, Resp> =
            Arc::new(move |request| Box::pin(handler(request)));
        Ok(CommandExecutor {
            inner: Arc::new(ExecutorInner {
                client,
                clock,
                pattern,
                cache: DedupCache::new(cache_ttl.max(Duration::from_secs(1)), options.cache_capacity),
                handler,
                cacheable: options.cacheable_ttl.is_some(),
                idempotent: options.idempotent,
                shutdown: CancellationToken::new(),
            }),
            filter,
            dispatch_concurrency: options.dispatch_concurrency,
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
                tokio::spawn(dispatch_loop(
                    Arc::clone(&self.inner),
                    messages,
                    self.dispatch_concurrency,
                ));
                Ok(())
            })
            .await
            .copied()
    }

    /// Stop dispatching, cancel in-flight handlers, release the subscription
    /// best-effort.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if self.started.get().is_some() {
            if let Err(e) = self.inner.client.unsubscribe(&self.filter).await {
                debug!(error = %e, filter = %self.filter, "unsubscribe on shutdown");
            }
        }
    }
}

impl<Req, Resp> Drop for CommandExecutor<Req, Resp> {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

async fn dispatch_loop<Req, Resp>(
    inner: Arc<ExecutorInner<Req, Resp>>,
    mut messages: tokio::sync::mpsc::UnboundedReceiver<InboundMessage>,
    dispatch_concurrency: usize,
) where
    Req: PayloadCodec,
    Resp: PayloadCodec,
{
    let permits = Arc::new(Semaphore::new(dispatch_concurrency));
    loop {
        tokio::select! {
            biased;
            () = inner.shutdown.cancelled() => break,
            inbound = messages.recv() => {
                let Some(inbound) = inbound else { break };
                // Bounded concurrency without blocking the client's inbound
                // dispatch: acquire before spawning.
                let permit = match Arc::clone(&permits).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    handle_request(inner, inbound).await;
                    drop(permit);
                });
            }
        }
    }
}

async fn handle_request<Req, Resp>(inner: Arc<ExecutorInner<Req, Resp>>, mut inbound: InboundMessage)
where
    Req: PayloadCodec,
    Resp: PayloadCodec,
{
    let ack = inbound.take_ack();
    let request = inbound.message;

    // Demarshal. A malformed request that still carries enough to answer gets
    // an error response; anything less is logged, acked, dropped.
    let meta = match InboundMeta::parse(&request.user_properties) {
        Ok(meta) => meta,
        Err(e) => {
            respond_error_if_possible(&inner, &request, &e).await;
            warn!(error = %e, topic = %request.topic, "dropping malformed request");
            return;
        }
    };
    let Some(response_topic) = request.response_topic.clone() else {
        warn!(topic = %request.topic, "request without response topic dropped");
        return;
    };
    let Some(correlation_id) =
        request.correlation_data.as_deref().and_then(correlation_uuid)
    else {
        warn!(topic = %request.topic, "request without usable correlation data dropped");
        return;
    };

    if let Err(e) = meta.require_version(SUPPORTED_RPC_MAJORS) {
        let detail = AppErrorDetail {
            message: Some(e.message.clone()),
            supported_major_versions: Some(SUPPORTED_RPC_MAJORS.to_vec()),
            property_name: None,
        };
        publish_error(&inner, &response_topic, &request, &e, detail).await;
        return;
    }
    let Some(source_id) = meta.source_id.clone() else {
        let e = Error::new(ErrorKind::HeaderMissing, "request carries no source id")
            .with_property(PROP_SOURCE_ID);
        let detail = AppErrorDetail {
            message: Some(e.message.clone()),
            supported_major_versions: None,
            property_name: Some(PROP_SOURCE_ID.to_owned()),
        };
        publish_error(&inner, &response_topic, &request, &e, detail).await;
        return;
    };
    if let Some(stamp) = &meta.timestamp {
        if let Err(e) = inner.clock.observe(stamp) {
            publish_error(
                &inner,
                &response_topic,
                &request,
                &e,
                AppErrorDetail::message(e.message.clone()),
            )
            .await;
            return;
        }
    }

    let fingerprint = Fingerprint { source_id: source_id.clone(), correlation_id };
    match inner.cache.claim(&fingerprint) {
        Claim::Execute => {
            execute(inner, request, meta, source_id, response_topic, fingerprint, ack).await;
        }
        Claim::Follow(mut outcome) => {
            debug!(%correlation_id, "duplicate while running; following in-flight outcome");
            let outcome = outcome.wait_for(Option::is_some).await.map(|stored| stored.as_ref().map(|s| s.envelope.clone()));
            match outcome {
                Ok(envelope) => {
                    if let Some(envelope) = envelope {
                        publish_stored(&inner, envelope, ack).await;
                    }
                }
                Err(_) => {
                    // Computation aborted; leave the request unacked so the
                    // broker redelivers it.
                    debug!(%correlation_id, "in-flight computation aborted; awaiting redelivery");
                    if let Some(ack) = ack {
                        ack.abandon();
                    }
                }
            }
        }
        Claim::Replay(stored) => {
            debug!(%correlation_id, "duplicate after completion; replaying stored response");
            publish_stored(&inner, stored.envelope, ack).await;
        }
    }
}

/// Run the handler and publish its outcome.  Called with the fingerprint
/// freshly claimed; every exit either completes or aborts the cache entry.
async fn execute<Req, Resp>(
    inner: Arc<ExecutorInner<Req, Resp>>,
    request: Envelope,
    meta: InboundMeta,
    source_id: String,
    response_topic: String,
    fingerprint: Fingerprint,
    ack: Option<AckToken>,
) where
    Req: PayloadCodec,
    Resp: PayloadCodec,
{
    let outcome = run_handler(&inner, &request, meta, source_id).await;
    let (envelope, failed) = match outcome {
        Ok(reply) => match build_response(&inner, &request, &response_topic, reply) {
            Ok(envelope) => (envelope, false),
            Err(e) => {
                error!(error = %e, "response could not be built");
                match build_error_response(
                    &inner,
                    &request,
                    &response_topic,
                    &e,
                    AppErrorDetail::message(e.message.clone()),
                ) {
                    Some(envelope) => (envelope, true),
                    None => {
                        inner.cache.abort(&fingerprint);
                        return;
                    }
                }
            }
        },
        Err(e) => {
            let detail = AppErrorDetail::message(e.message.clone());
            match build_error_response(&inner, &request, &response_topic, &e, detail) {
                Some(envelope) => (envelope, true),
                None => {
                    inner.cache.abort(&fingerprint);
                    return;
                }
            }
        }
    };

    let retention = if inner.cacheable { Retention::Keep } else { Retention::DropAfterAck };
    inner
        .cache
        .complete(&fingerprint, StoredResponse { envelope: envelope.clone(), failed }, retention);
    if inner.idempotent && !inner.cacheable {
        // Re-invocation is harmless, so the outcome is released right away;
        // followers that attached while running already hold it.
        inner.cache.evict(&fingerprint);
    }

    // Ack-after-publish: confirm the request only once the response made it
    // to the broker.
    match inner.client.publish(envelope).await {
        Ok(()) => {
            if let Some(ack) = ack {
                ack.ack();
            }
            if !inner.cacheable {
                inner.cache.evict(&fingerprint);
            }
        }
        Err(e) => {
            warn!(error = %e, topic = %response_topic, "response publish failed; leaving request unacked");
            if let Some(ack) = ack {
                ack.abandon();
            }
        }
    }
}

/// Decode, invoke, and bound the handler by the request's message expiry.
async fn run_handler<Req, Resp>(
    inner: &Arc<ExecutorInner<Req, Resp>>,
    request: &Envelope,
    meta: InboundMeta,
    source_id: String,
) -> Result<CommandReply<Resp>>
where
    Req: PayloadCodec,
    Resp: PayloadCodec,
{
    let payload = Req::decode(
        &request.payload,
        request.content_type.as_deref(),
        request.format_indicator,
    )
    .map_err(|e| Error::new(ErrorKind::PayloadInvalid, e.to_string()))?;

    let topic_tokens = inner.pattern.match_topic(&request.topic).unwrap_or_default();
    let cancellation = inner.shutdown.child_token();
    let command = CommandRequest {
        payload,
        user_data: meta.user_data,
        timestamp: meta.timestamp,
        source_id,
        topic: request.topic.clone(),
        topic_tokens,
        cancellation: cancellation.clone(),
    };

    let handler_future = (inner.handler)(command);
    tokio::pin!(handler_future);
    let result = match request.message_expiry {
        Some(deadline) => {
            tokio::select! {
                result = &mut handler_future => result,
                () = tokio::time::sleep(deadline) => {
                    // Signal the handler, then give it a moment to unwind.
                    cancellation.cancel();
                    match tokio::time::timeout(CANCEL_GRACE, &mut handler_future).await {
                        Ok(result) => result,
                        Err(_) => {
                            return Err(Error::new(
                                ErrorKind::Timeout,
                                "handler exceeded the request deadline",
                            ));
                        }
                    }
                }
            }
        }
        None => handler_future.await,
    };
    result.map_err(|message| {
        Error::new(ErrorKind::ExecutorError, message).in_application()
    })
}

fn build_response<Req, Resp>(
    inner: &Arc<ExecutorInner<Req, Resp>>,
    request: &Envelope,
    response_topic: &str,
    reply: CommandReply<Resp>,
) -> Result<Envelope>
where
    Req: PayloadCodec,
    Resp: PayloadCodec,
{
    let encoded = reply
        .payload
        .encode()
        .map_err(|e| Error::new(ErrorKind::PayloadInvalid, e.to_string()))?;
    let stamp = inner.clock.stamp()?;
    let user_properties = OutboundMeta {
        source_id: inner.client.client_id(),
        timestamp: Some(&stamp),
        version: RPC_VERSION,
        stream: None,
        app_error: None,
        user_data: &reply.user_data,
    }
    .into_properties()?;
    Ok(Envelope {
        topic: response_topic.to_owned(),
        payload: encoded.bytes,
        qos: QoS::AtLeastOnce,
        retain: false,
        content_type: encoded.content_type,
        format_indicator: encoded.format_indicator,
        correlation_data: request.correlation_data.clone(),
        response_topic: None,
        message_expiry: request.message_expiry,
        user_properties,
    })
}

fn build_error_response<Req, Resp>(
    inner: &Arc<ExecutorInner<Req, Resp>>,
    request: &Envelope,
    response_topic: &str,
    err: &Error,
    detail: AppErrorDetail,
) -> Option<Envelope> {
    let code = err.kind.as_app_code()?;
    let stamp = inner.clock.stamp().ok();
    let user_properties = OutboundMeta {
        source_id: inner.client.client_id(),
        timestamp: stamp.as_ref(),
        version: RPC_VERSION,
        stream: None,
        app_error: Some((code, detail)),
        user_data: &[],
    }
    .into_properties()
    .ok()?;
    Some(Envelope {
        topic: response_topic.to_owned(),
        qos: QoS::AtLeastOnce,
        correlation_data: request.correlation_data.clone(),
        message_expiry: request.message_expiry,
        user_properties,
        ..Envelope::default()
    })
}

async fn publish_error<Req, Resp>(
    inner: &Arc<ExecutorInner<Req, Resp>>,
    response_topic: &str,
    request: &Envelope,
    err: &Error,
    detail: AppErrorDetail,
) {
    debug!(error = %err, topic = %request.topic, "rejecting request");
    if let Some(envelope) = build_error_response(inner, request, response_topic, err, detail) {
        if let Err(e) = inner.client.publish(envelope).await {
            warn!(error = %e, "error response publish failed");
        }
    }
}

/// Publish a stored (deduplicated) response and settle the request ack on
/// the same ack-after-publish policy as first execution.
async fn publish_stored<Req, Resp>(
    inner: &Arc<ExecutorInner<Req, Resp>>,
    envelope: Envelope,
    ack: Option<AckToken>,
) {
    let topic = envelope.topic.clone();
    match inner.client.publish(envelope).await {
        Ok(()) => {
            if let Some(ack) = ack {
                ack.ack();
            }
        }
        Err(e) => {
            warn!(error = %e, topic = %topic, "stored response publish failed; leaving request unacked");
            if let Some(ack) = ack {
                ack.abandon();
            }
        }
    }
}

/// Best-effort error reply for requests whose metadata failed to demarshal.
async fn respond_error_if_possible<Req, Resp>(
    inner: &Arc<ExecutorInner<Req, Resp>>,
    request: &Envelope,
    err: &Error,
) {
    if let Some(response_topic) = request.response_topic.clone() {
        if request.correlation_data.as_deref().and_then(correlation_uuid).is_some() {
            let detail = AppErrorDetail {
                message: Some(err.message.clone()),
                supported_major_versions: None,
                property_name: err.property_name.clone(),
            };
            publish_error(inner, &response_topic, request, err, detail).await;
        }
    }
}
