//! Executor-side request dedup cache.
//!
//! Keyed by the request fingerprint `(source_id, correlation_id)`.  The first
//! receipt claims the fingerprint and runs the user handler; duplicates that
//! arrive while the handler runs follow the in-flight computation, and
//! duplicates after completion replay the stored response without re-invoking
//! the handler.  `Running` entries are pinned: neither the TTL sweep nor LRU
//! pressure may evict them.

use crate::mqtt::Envelope;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Identity of a request as seen by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Fingerprint {
    pub source_id: String,
    pub correlation_id: Uuid,
}

/// A terminal outcome ready to republish.
#[derive(Debug, Clone)]
pub(crate) struct StoredResponse {
    pub envelope: Envelope,
    /// True when the envelope carries an error response.
    pub failed: bool,
}

/// What to do with the outcome once the response publish is acked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retention {
    /// Cacheable command: keep for the configured TTL.
    Keep,
    /// Keep only until the executor confirms the response ack, plus a short
    /// safety window in case that confirmation never comes.
    DropAfterAck,
}

enum EntryState {
    Running(watch::Receiver<Option<StoredResponse>>, watch::Sender<Option<StoredResponse>>),
    Terminal(StoredResponse),
}

struct Entry {
    state: EntryState,
    /// `None` while running (pinned).
    expires_at: Option<Instant>,
}

/// Outcome of claiming a fingerprint.
pub(crate) enum Claim {
    /// First receipt: run the handler, then `complete` or `abort`.
    Execute,
    /// Handler already running: await the watch; a closed channel means the
    /// computation aborted and the broker's redelivery will retry.
    Follow(watch::Receiver<Option<StoredResponse>>),
    /// Terminal outcome: republish it.
    Replay(StoredResponse),
}

pub(crate) struct DedupCache {
    state: Mutex<CacheState>,
    ttl: Duration,
    capacity: usize,
}

struct CacheState {
    entries: HashMap<Fingerprint, Entry>,
    /// Least-recently-used first.
    recency: Vec<Fingerprint>,
}

/// Safety expiry for `DropAfterAck` outcomes whose eviction never arrives.
const UNACKED_SAFETY_TTL: Duration = Duration::from_secs(10);

impl DedupCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        DedupCache {
            state: Mutex::new(CacheState { entries: HashMap::new(), recency: Vec::new() }),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Claim `fingerprint`, inserting a pinned `Running` entry on a miss.
    pub fn claim(&self, fingerprint: &Fingerprint) -> Claim {
        let mut state = self.lock();
        state.sweep();
        if let Some(entry) = state.entries.get(fingerprint) {
            let claim = match &entry.state {
                EntryState::Running(rx, _) => Claim::Follow(rx.clone()),
                EntryState::Terminal(stored) => Claim::Replay(stored.clone()),
            };
            state.touch(fingerprint);
            return claim;
        }
        state.make_room(self.capacity);
        let (tx, rx) = watch::channel(None);
        state.entries.insert(
            fingerprint.clone(),
            Entry { state: EntryState::Running(rx, tx), expires_at: None },
        );
        state.recency.push(fingerprint.clone());
        Claim::Execute
    }

    /// Store the terminal outcome and wake every follower.
    pub fn complete(
        &self,
        fingerprint: &Fingerprint,
        stored: StoredResponse,
        retention: Retention,
    ) {
        let mut state = self.lock();
        let expires_at = match retention {
            Retention::Keep => Instant::now() + self.ttl,
            Retention::DropAfterAck => Instant::now() + UNACKED_SAFETY_TTL,
        };
        if let Some(entry) = state.entries.get_mut(fingerprint) {
            if let EntryState::Running(_, tx) = &entry.state {
                let _ = tx.send(Some(stored.clone()));
            }
            entry.state = EntryState::Terminal(stored);
            entry.expires_at = Some(expires_at);
        }
    }

    /// Drop a `Running` entry whose computation died; followers observe the
    /// closed channel and leave retry to broker redelivery.
    pub fn abort(&self, fingerprint: &Fingerprint) {
        let mut state = self.lock();
        if matches!(
            state.entries.get(fingerprint),
            Some(Entry { state: EntryState::Running(..), .. })
        ) {
            state.remove(fingerprint);
        }
    }

    /// Evict a terminal entry once its response ack is confirmed.
    pub fn evict(&self, fingerprint: &Fingerprint) {
        let mut state = self.lock();
        if matches!(
            state.entries.get(fingerprint),
            Some(Entry { state: EntryState::Terminal(_), .. })
        ) {
            state.remove(fingerprint);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl CacheState {
    fn touch(&mut self, fingerprint: &Fingerprint) {
        if let Some(pos) = self.recency.iter().position(|f| f == fingerprint) {
            let f = self.recency.remove(pos);
            self.recency.push(f);
        }
    }

    fn remove(&mut self, fingerprint: &Fingerprint) {
        self.entries.remove(fingerprint);
        self.recency.retain(|f| f != fingerprint);
    }

    /// Time-based eviction of expired terminal entries.
    fn sweep(&mut self) {
        let now = Instant::now();
        let expired: Vec<Fingerprint> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
            .map(|(f, _)| f.clone())
            .collect();
        for fingerprint in expired {
            debug!(%fingerprint.correlation_id, "dedup entry expired");
            self.remove(&fingerprint);
        }
    }

    /// Capacity-based eviction, oldest terminal entry first.  Running entries
    /// are pinned, so the cache may transiently exceed its bound when every
    /// entry is in flight.
    fn make_room(&mut self, capacity: usize) {
        while self.entries.len() >= capacity {
            let victim = self.recency.iter().find(|f| {
                matches!(
                    self.entries.get(*f),
                    Some(Entry { state: EntryState::Terminal(_), .. })
                )
            });
            match victim.cloned() {
                Some(fingerprint) => self.remove(&fingerprint),
                None => break,
            }
        }
    }
}
