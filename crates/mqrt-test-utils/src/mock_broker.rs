// mock_broker: An in-memory MQTT v5 stand-in for envoy tests.
//
// One `MockBroker` hosts any number of `MockClient`s.  Publishes route to
// every client holding a matching subscription, fan out to that client's
// matching filtered receivers, and record an ack probe per delivery so tests
// can assert on ack-after-publish policies.  QoS-1 redelivery is driven
// manually through `redeliver`.

use async_trait::async_trait;
use mqrt::mqtt::{
    AckToken, ConnectionState, Envelope, InboundMessage, MqttClient, MqttError, QoS,
};
use mqrt::topic::filter_matches;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};

/// Broker-side view of one delivery's acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Pending,
    Acked,
    /// The receiver consumed the token without acking; the delivery is
    /// eligible for redelivery.
    Abandoned,
}

struct Probe {
    topic: String,
    state: Arc<AtomicU8>,
}

struct ClientEntry {
    subscriptions: HashSet<String>,
    routes: Vec<(String, mpsc::UnboundedSender<InboundMessage>)>,
    connection: watch::Sender<ConnectionState>,
    online: bool,
    queued: Vec<(Envelope, oneshot::Sender<()>)>,
}

struct BrokerState {
    clients: HashMap<String, ClientEntry>,
    published: Vec<Envelope>,
    probes: Vec<Probe>,
}

/// In-memory broker; cheap to clone.
#[derive(Clone)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        MockBroker {
            state: Arc::new(Mutex::new(BrokerState {
                clients: HashMap::new(),
                published: Vec::new(),
                probes: Vec::new(),
            })),
        }
    }

    /// Register a v5 client.
    pub fn client(&self, client_id: &str) -> Arc<MockClient> {
        self.client_with_version(client_id, 5)
    }

    /// Register a client speaking an arbitrary MQTT protocol level.
    pub fn client_with_version(&self, client_id: &str, version: u8) -> Arc<MockClient> {
        let (connection, _) = watch::channel(ConnectionState::Connected);
        let mut state = lock(&self.state);
        state.clients.insert(
            client_id.to_owned(),
            ClientEntry {
                subscriptions: HashSet::new(),
                routes: Vec::new(),
                connection,
                online: true,
                queued: Vec::new(),
            },
        );
        Arc::new(MockClient {
            id: client_id.to_owned(),
            version,
            state: Arc::clone(&self.state),
        })
    }

    /// Every publish the broker has seen, in order.
    pub fn published(&self) -> Vec<Envelope> {
        lock(&self.state).published.clone()
    }

    /// Publishes whose topic matches `filter`.
    pub fn published_to(&self, filter: &str) -> Vec<Envelope> {
        lock(&self.state)
            .published
            .iter()
            .filter(|e| filter_matches(filter, &e.topic))
            .cloned()
            .collect()
    }

    /// Re-inject a publish, as a broker would redeliver an unacked QoS-1
    /// message.
    pub fn redeliver(&self, envelope: &Envelope) {
        deliver(&self.state, envelope, false);
    }

    /// Transport drop with session kept: subsequent publishes queue.
    pub fn go_offline(&self, client_id: &str) {
        let state = &mut *lock(&self.state);
        if let Some(entry) = state.clients.get_mut(client_id) {
            entry.online = false;
            let _ = entry.connection.send(ConnectionState::Disconnected);
        }
    }

    /// Reconnect with the session intact; queued publishes flush in order.
    pub async fn reconnect(&self, client_id: &str) {
        let queued = {
            let state = &mut *lock(&self.state);
            match state.clients.get_mut(client_id) {
                Some(entry) => {
                    entry.online = true;
                    let _ = entry.connection.send(ConnectionState::Connected);
                    std::mem::take(&mut entry.queued)
                }
                None => Vec::new(),
            }
        };
        for (envelope, done) in queued {
            deliver(&self.state, &envelope, true);
            let _ = done.send(());
        }
    }

    /// End the session: queued publishes are lost and the client observes
    /// `SessionLost`.
    pub fn lose_session(&self, client_id: &str) {
        let state = &mut *lock(&self.state);
        if let Some(entry) = state.clients.get_mut(client_id) {
            entry.online = false;
            entry.queued.clear();
            let _ = entry.connection.send(ConnectionState::SessionLost);
        }
    }

    /// Ack probe snapshots for deliveries on `topic`, in delivery order.
    pub fn ack_states(&self, topic: &str) -> Vec<AckState> {
        lock(&self.state)
            .probes
            .iter()
            .filter(|p| p.topic == topic)
            .map(|p| match p.state.load(Ordering::SeqCst) {
                1 => AckState::Acked,
                2 => AckState::Abandoned,
                _ => AckState::Pending,
            })
            .collect()
    }

    /// Wait until no delivery on `topic` is still pending.
    pub async fn settled(&self, topic: &str) {
        loop {
            if !self.ack_states(topic).contains(&AckState::Pending) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    }
}

/// Client handle implementing the runtime's MQTT contract.
pub struct MockClient {
    id: String,
    version: u8,
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl MqttClient for MockClient {
    fn client_id(&self) -> &str {
        &self.id
    }

    fn mqtt_version(&self) -> u8 {
        self.version
    }

    async fn publish(&self, envelope: Envelope) -> Result<(), MqttError> {
        let wait = {
            let state = &mut *lock(&self.state);
            let entry = state
                .clients
                .get_mut(&self.id)
                .ok_or(MqttError::Closed)?;
            if *entry.connection.borrow() == ConnectionState::SessionLost {
                return Err(MqttError::SessionLost);
            }
            if entry.online {
                None
            } else {
                let (done, wait) = oneshot::channel();
                entry.queued.push((envelope.clone(), done));
                Some(wait)
            }
        };
        match wait {
            None => {
                deliver(&self.state, &envelope, true);
                Ok(())
            }
            // Queued while offline: the puback arrives when the session
            // reconnects and flushes.
            Some(wait) => wait.await.map_err(|_| MqttError::SessionLost),
        }
    }

    async fn subscribe(&self, filter: &str, _qos: QoS) -> Result<(), MqttError> {
        let state = &mut *lock(&self.state);
        let entry = state.clients.get_mut(&self.id).ok_or(MqttError::Closed)?;
        entry.subscriptions.insert(filter.to_owned());
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), MqttError> {
        let state = &mut *lock(&self.state);
        let entry = state.clients.get_mut(&self.id).ok_or(MqttError::Closed)?;
        entry.subscriptions.remove(filter);
        Ok(())
    }

    fn filtered_messages(&self, filter: &str) -> mpsc::UnboundedReceiver<InboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = &mut *lock(&self.state);
        if let Some(entry) = state.clients.get_mut(&self.id) {
            entry.routes.push((filter.to_owned(), tx));
        }
        rx
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        let state = lock(&self.state);
        match state.clients.get(&self.id) {
            Some(entry) => entry.connection.subscribe(),
            None => watch::channel(ConnectionState::SessionLost).1,
        }
    }
}

/// Route a publish to every matching subscriber and arm an ack probe per
/// delivery.  `record` is false for forced redelivery so the publish log
/// keeps one entry per original publish.
fn deliver(state: &Arc<Mutex<BrokerState>>, envelope: &Envelope, record: bool) {
    let mut new_probes = Vec::new();
    {
        let state = &mut *lock(state);
        if record {
            state.published.push(envelope.clone());
        }
        for entry in state.clients.values_mut() {
            if !entry
                .subscriptions
                .iter()
                .any(|f| filter_matches(f, &envelope.topic))
            {
                continue;
            }
            entry.routes.retain(|(_, tx)| !tx.is_closed());
            for (route_filter, tx) in &entry.routes {
                if !filter_matches(route_filter, &envelope.topic) {
                    continue;
                }
                let (token, settled) = AckToken::channel();
                let probe = Arc::new(AtomicU8::new(0));
                new_probes.push((envelope.topic.clone(), Arc::clone(&probe), settled));
                let _ = tx.send(InboundMessage {
                    message: envelope.clone(),
                    ack: Some(token),
                });
            }
        }
        for (topic, probe, _) in &new_probes {
            state.probes.push(Probe { topic: topic.clone(), state: Arc::clone(probe) });
        }
    }
    for (_, probe, settled) in new_probes {
        tokio::spawn(async move {
            let outcome = match settled.await {
                Ok(()) => 1,
                Err(_) => 2,
            };
            probe.store(outcome, Ordering::SeqCst);
        });
    }
}

fn lock(state: &Arc<Mutex<BrokerState>>) -> std::sync::MutexGuard<'_, BrokerState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
