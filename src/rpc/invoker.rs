//! Command invoker envoy.
//!
//! One invoker owns one request topic pattern.  `invoke` resolves the topic,
//! publishes the request with a fresh correlation id and the envoy's response
//! topic, and completes when the matching response arrives, the deadline
//! elapses, or the caller's cancellation token fires.
//!
//! The response topic is prefixed `clients/{invokerClientId}/` by default so
//! the broker scopes response delivery to this client.

use crate::error::{Error, ErrorKind, Result};
use crate::hlc::{HybridLogicalClock, SharedClock};
use crate::meta::{InboundMeta, OutboundMeta};
use crate::mqtt::{Envelope, MqttClient, QoS, require_mqtt_v5};
use crate::payload::PayloadCodec;
use crate::rpc::correlation::{CorrelationRegistry, response_dispatch_loop};
use crate::rpc::expiry_interval;
use crate::topic::TopicPattern;
use bytes::Bytes;
use mqrt_protocol::{RPC_VERSION, SUPPORTED_RPC_MAJORS};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Construction-time configuration.
#[derive(Debug, Clone)]
pub struct CommandInvokerOptions {
    /// Request topic pattern, e.g. `fleet/{vehicleId}/cmd/{commandName}`.
    pub request_pattern: String,
    /// Constant token bindings for the lifetime of the envoy.
    pub topic_tokens: HashMap<String, String>,
    /// Response-topic ownership prefix; `clients/{clientId}` when `None`.
    pub response_topic_prefix: Option<String>,
}

/// Per-call configuration.
#[derive(Debug, Clone)]
pub struct InvokeOptions {
    /// Deadline for the whole invocation.
    pub timeout: Duration,
    /// Transient token bindings for this call.
    pub topic_tokens: HashMap<String, String>,
    /// Caller metadata; reserved names are rejected.
    pub user_data: Vec<(String, String)>,
    /// Message expiry override; defaults to the timeout, rounded up to whole
    /// seconds.
    pub message_expiry: Option<Duration>,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        InvokeOptions {
            timeout: Duration::from_secs(10),
            topic_tokens: HashMap::new(),
            user_data: Vec::new(),
            message_expiry: None,
        }
    }
}

/// A successful command response.
#[derive(Debug)]
pub struct CommandResponse<Resp> {
    pub payload: Resp,
    /// Non-reserved user properties from the response.
    pub user_data: Vec<(String, String)>,
    /// Executor clock stamp, already merged into the process clock.
    pub timestamp: Option<HybridLogicalClock>,
}

/// Command invoker envoy; see the module docs.
pub struct CommandInvoker<Req, Resp> {
    client: Arc<dyn MqttClient>,
    clock: SharedClock,
    pattern: TopicPattern,
    response_prefix: String,
    response_filter: String,
    registry: Arc<CorrelationRegistry>,
    started: OnceCell<()>,
    shutdown: CancellationToken,
    _request: PhantomData<fn(Req)>,
    _response: PhantomData<fn() -> Resp>,
}

impl<Req, Resp> std::fmt::Debug for CommandInvoker<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandInvoker")
            .field("pattern", &self.pattern)
            .field("response_prefix", &self.response_prefix)
            .field("response_filter", &self.response_filter)
            .finish_non_exhaustive()
    }
}

impl<Req, Resp> CommandInvoker<Req, Resp>
where
    Req: PayloadCodec,
    Resp: PayloadCodec,
{
    /// Build an invoker on `client` for `options.request_pattern`.
    pub fn new(
        client: Arc<dyn MqttClient>,
        clock: SharedClock,
        options: CommandInvokerOptions,
    ) -> Result<Self> {
        require_mqtt_v5(client.as_ref())?;
        let pattern = TopicPattern::new(&options.request_pattern, options.topic_tokens)?;
        let response_prefix = match options.response_topic_prefix {
            Some(prefix) => {
                // The prefix becomes part of a concrete topic; validate it as
                // a replacement (labels only, no wildcards).
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
        Ok(CommandInvoker {
            client,
            clock,
            pattern,
            response_prefix,
            response_filter,
            registry: Arc::new(CorrelationRegistry::new()),
            started: OnceCell::new(),
            shutdown: CancellationToken::new(),
            _request: PhantomData,
            _response: PhantomData,
        })
    }

    /// Invoke the command and await its response.
    pub async fn invoke(
        &self,
        request: Req,
        options: InvokeOptions,
    ) -> Result<CommandResponse<Resp>> {
        self.invoke_with_cancellation(request, options, CancellationToken::new()).await
    }

    /// Invoke with a caller-held cancellation token.  Cancelling resolves the
    /// call with `Cancelled` without waiting for the executor; a late
    /// response is acked and discarded.
    pub async fn invoke_with_cancellation(
        &self,
        request: Req,
        options: InvokeOptions,
        cancellation: CancellationToken,
    ) -> Result<CommandResponse<Resp>> {
        if self.shutdown.is_cancelled() {
            return Err(Error::shallow(ErrorKind::Disposed, "invoker is disposed"));
        }
        let expiry = expiry_interval(options.timeout, options.message_expiry)?;
        self.ensure_started().await?;

        let topic = self.pattern.publish_topic(&options.topic_tokens)?;
        let encoded = request
            .encode()
            .map_err(|e| Error::shallow(ErrorKind::PayloadInvalid, e.to_string()))?;
        let stamp = self.clock.stamp()?;
        let user_properties = OutboundMeta {
            source_id: self.client.client_id(),
            timestamp: Some(&stamp),
            version: RPC_VERSION,
            stream: None,
            app_error: None,
            user_data: &options.user_data,
        }
        .into_properties()?;

        let correlation_id = Uuid::new_v4();
        let response_topic = format!("{}/{topic}", self.response_prefix);
        let envelope = Envelope {
            topic,
            payload: encoded.bytes,
            qos: QoS::AtLeastOnce,
            retain: false,
            content_type: encoded.content_type,
            format_indicator: encoded.format_indicator,
            correlation_data: Some(Bytes::copy_from_slice(correlation_id.as_bytes())),
            response_topic: Some(response_topic),
            message_expiry: Some(expiry),
            user_properties,
        };

        let waiter = self.registry.register_single(correlation_id)?;
        if let Err(e) = self.client.publish(envelope).await {
            self.registry.retire_entry(correlation_id);
            return Err(e.into());
        }

        let response = tokio::select! {
            outcome = waiter => match outcome {
                Ok(result) => result?,
                // Registry dropped the sender without completing: disposal
                // races; report it as such.
                Err(_) => return Err(Error::new(ErrorKind::Disposed, "invoker is disposed")),
            },
            () = tokio::time::sleep(options.timeout) => {
                self.registry.retire_entry(correlation_id);
                return Err(Error::new(
                    ErrorKind::Timeout,
                    format!("command timed out after {:?}", options.timeout),
                ));
            }
            () = cancellation.cancelled() => {
                self.registry.retire_entry(correlation_id);
                return Err(Error::new(ErrorKind::Cancelled, "command cancelled by caller"));
            }
        };

        self.decode_response(response)
    }

    fn decode_response(&self, envelope: Envelope) -> Result<CommandResponse<Resp>> {
        let meta = InboundMeta::parse(&envelope.user_properties)?;
        meta.require_version(SUPPORTED_RPC_MAJORS)?;
        if let Some(stamp) = &meta.timestamp {
            self.clock.observe(stamp)?;
        }
        if let Some(failure) = meta.failure {
            return Err(failure.into_error());
        }
        let payload = Resp::decode(
            &envelope.payload,
            envelope.content_type.as_deref(),
            envelope.format_indicator,
        )
        .map_err(|e| Error::new(ErrorKind::PayloadInvalid, e.to_string()).remote())?;
        Ok(CommandResponse { payload, user_data: meta.user_data, timestamp: meta.timestamp })
    }

    /// Subscribe to the response filter and start the dispatch loop; runs at
    /// most once per envoy lifetime.
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

    /// Dispose the envoy: stop dispatch, complete pending waiters with
    /// `Disposed`, release the subscription best-effort.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.registry.fail_all(ErrorKind::Disposed, "invoker disposed");
        if self.started.get().is_some() {
            if let Err(e) = self.client.unsubscribe(&self.response_filter).await {
                debug!(error = %e, filter = %self.response_filter, "unsubscribe on shutdown");
            }
        }
    }
}

impl<Req, Resp> Drop for CommandInvoker<Req, Resp> {
    fn drop(&mut self) {
        // Severs the client -> dispatch-loop -> registry path; waiters that
        // are still alive complete with Disposed.
        self.shutdown.cancel();
        self.registry.fail_all(ErrorKind::Disposed, "invoker disposed");
    }
}

