//! Invoker-side correlation registry.
//!
//! Every in-flight invocation owns one entry keyed by its correlation id.
//! The dispatch loop routes inbound publishes on the response topic to the
//! matching waiter; single-response waiters are removed on delivery, stream
//! waiters stay until the invocation unregisters them.  Expired and cancelled
//! ids are remembered for a grace period so stragglers are acked quietly
//! instead of being reported as unknown.

use crate::error::{Error, ErrorKind, Result};
use crate::mqtt::{ConnectionState, Envelope, InboundMessage};
use crate::rpc::correlation_uuid;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// How long a completed, cancelled, or timed-out id keeps absorbing
/// stragglers.
pub(crate) const STRAGGLER_GRACE: Duration = Duration::from_secs(10);

pub(crate) enum Waiter {
    Single(oneshot::Sender<Result<Envelope>>),
    Stream(mpsc::UnboundedSender<Result<Envelope>>),
}

/// Where an inbound response went.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RouteOutcome {
    Delivered,
    /// Correlation id recently expired or was cancelled; ack and drop.
    Straggler,
    /// Never seen (or past grace); ack, drop, and log louder.
    Unknown,
}

struct RegistryState {
    pending: HashMap<Uuid, Waiter>,
    /// Recently retired ids and when they retire from the grace list.
    retired: Vec<(Instant, Uuid)>,
    disposed: bool,
}

/// Pending-request table for one invoker envoy.
pub(crate) struct CorrelationRegistry {
    state: Mutex<RegistryState>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        CorrelationRegistry {
            state: Mutex::new(RegistryState {
                pending: HashMap::new(),
                retired: Vec::new(),
                disposed: false,
            }),
        }
    }

    /// Register a classical-RPC waiter.
    pub fn register_single(&self, id: Uuid) -> Result<oneshot::Receiver<Result<Envelope>>> {
        let (tx, rx) = oneshot::channel();
        self.register(id, Waiter::Single(tx))?;
        Ok(rx)
    }

    /// Register a streamed-RPC waiter.
    pub fn register_stream(&self, id: Uuid) -> Result<mpsc::UnboundedReceiver<Result<Envelope>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(id, Waiter::Stream(tx))?;
        Ok(rx)
    }

    fn register(&self, id: Uuid, waiter: Waiter) -> Result<()> {
        let mut state = self.lock();
        if state.disposed {
            return Err(Error::shallow(ErrorKind::Disposed, "envoy is disposed"));
        }
        if state.pending.contains_key(&id) {
            return Err(Error::new(
                ErrorKind::StateInvalid,
                format!("correlation id {id} already registered"),
            ));
        }
        state.pending.insert(id, waiter);
        Ok(())
    }

    /// Route an inbound response to its waiter.
    pub fn route(&self, id: Uuid, envelope: Envelope) -> RouteOutcome {
        let mut state = self.lock();
        sweep(&mut state.retired);
        match state.pending.remove(&id) {
            Some(Waiter::Stream(tx)) => {
                if tx.send(Ok(envelope)).is_ok() {
                    state.pending.insert(id, Waiter::Stream(tx));
                    RouteOutcome::Delivered
                } else {
                    // Consumer went away; retire the entry.
                    retire(&mut state.retired, id);
                    RouteOutcome::Straggler
                }
            }
            Some(Waiter::Single(tx)) => {
                retire(&mut state.retired, id);
                if tx.send(Ok(envelope)).is_ok() {
                    RouteOutcome::Delivered
                } else {
                    RouteOutcome::Straggler
                }
            }
            None => {
                if state.retired.iter().any(|(_, retired)| *retired == id) {
                    RouteOutcome::Straggler
                } else {
                    RouteOutcome::Unknown
                }
            }
        }
    }

    /// Remove an entry after timeout, cancellation, or completion, keeping
    /// the id in the grace list.
    pub fn retire_entry(&self, id: Uuid) {
        let mut state = self.lock();
        state.pending.remove(&id);
        sweep(&mut state.retired);
        retire(&mut state.retired, id);
    }

    /// Fail a single entry with `err` (stream waiters receive it in-band).
    pub fn fail_entry(&self, id: Uuid, err: Error) {
        let waiter = {
            let mut state = self.lock();
            let waiter = state.pending.remove(&id);
            retire(&mut state.retired, id);
            waiter
        };
        match waiter {
            Some(Waiter::Single(tx)) => {
                let _ = tx.send(Err(err));
            }
            Some(Waiter::Stream(tx)) => {
                let _ = tx.send(Err(err));
            }
            None => {}
        }
    }

    /// Fail every pending entry; used on session loss and disposal.
    pub fn fail_all(&self, kind: ErrorKind, message: &str) {
        let drained: Vec<(Uuid, Waiter)> = {
            let mut state = self.lock();
            if kind == ErrorKind::Disposed {
                state.disposed = true;
            }
            state.pending.drain().collect()
        };
        for (_, waiter) in drained {
            let err = Error::new(kind, message);
            match waiter {
                Waiter::Single(tx) => {
                    let _ = tx.send(Err(err));
                }
                Waiter::Stream(tx) => {
                    let _ = tx.send(Err(err));
                }
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Shared dispatch loop for invoker-side envoys: routes response-topic
/// publishes into the registry and flushes it on session loss.  Dropping a
/// routed message's embedded ack token acknowledges the publish on every
/// path, so unknown and straggler responses are acked and ignored.
pub(crate) async fn response_dispatch_loop(
    mut messages: mpsc::UnboundedReceiver<InboundMessage>,
    mut connection: watch::Receiver<ConnectionState>,
    registry: Arc<CorrelationRegistry>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                if *connection.borrow() == ConnectionState::SessionLost {
                    registry.fail_all(
                        ErrorKind::ConnectionLost,
                        "MQTT session lost with invocations outstanding",
                    );
                }
            }
            inbound = messages.recv() => {
                let Some(inbound) = inbound else { break };
                route_response(&registry, inbound.message);
            }
        }
    }
}

fn route_response(registry: &CorrelationRegistry, envelope: Envelope) {
    let Some(correlation_id) = envelope
        .correlation_data
        .as_deref()
        .and_then(correlation_uuid)
    else {
        warn!(topic = %envelope.topic, "response without usable correlation data");
        return;
    };
    match registry.route(correlation_id, envelope) {
        RouteOutcome::Delivered => {}
        RouteOutcome::Straggler => {
            debug!(%correlation_id, "late response discarded");
        }
        RouteOutcome::Unknown => {
            warn!(%correlation_id, "response with unknown correlation id discarded");
        }
    }
}

fn retire(retired: &mut Vec<(Instant, Uuid)>, id: Uuid) {
    retired.push((Instant::now() + STRAGGLER_GRACE, id));
}

fn sweep(retired: &mut Vec<(Instant, Uuid)>) {
    let now = Instant::now();
    retired.retain(|(until, _)| *until > now);
}
