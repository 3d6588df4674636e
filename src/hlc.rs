//! Hybrid logical clock.
//!
//! A stamp is the triple `(timestamp, counter, node_id)`: wall-clock millis,
//! an unsigned 32-bit tie-breaker, and the owning process id (normally the
//! MQTT client id).  Total order is lexicographic across the triple.
//!
//! A process owns exactly one [`SharedClock`]; envoys receive clones of the
//! handle and never construct their own.  Observing a remote stamp merges it
//! into the local clock without consuming a counter tick; emitting an
//! outbound stamp ticks the clock, so every stamp a process attaches to a
//! message is strictly greater than the previous one and greater than every
//! stamp it has observed.
//!
//! Wire form is `ts:counter:nodeId` in the `__ts` user property.

use crate::error::{Error, ErrorKind, Result};
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default bound on |remote timestamp - wall clock| before an observed stamp
/// is rejected.
pub const DEFAULT_MAX_DRIFT: Duration = Duration::from_secs(60);

/// A single clock value.
///
/// Field order matters: `derive(Ord)` yields the lexicographic
/// `(timestamp, counter, node_id)` order the protocol requires.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HybridLogicalClock {
    timestamp: DateTime<Utc>,
    counter: u32,
    node_id: String,
}

impl HybridLogicalClock {
    /// A zero-valued clock for `node_id`; ordered before any stamped value.
    pub fn new(node_id: impl Into<String>) -> Self {
        HybridLogicalClock {
            timestamp: Utc.timestamp_millis_opt(0).single().unwrap_or_default(),
            counter: 0,
            node_id: node_id.into(),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn from_parts(timestamp_ms: i64, counter: u32, node_id: &str) -> Option<Self> {
        let timestamp = Utc.timestamp_millis_opt(timestamp_ms).single()?;
        if node_id.is_empty() {
            return None;
        }
        Some(HybridLogicalClock { timestamp, counter, node_id: node_id.to_owned() })
    }
}

/// `ts:counter:nodeId`; the node id may itself contain colons.
impl fmt::Display for HybridLogicalClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.timestamp.timestamp_millis(), self.counter, self.node_id)
    }
}

impl FromStr for HybridLogicalClock {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut fields = s.splitn(3, ':');
        let (Some(ts), Some(counter), Some(node_id)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(malformed(s));
        };
        let ts = ts.parse::<i64>().map_err(|_| malformed(s))?;
        let counter = counter.parse::<u32>().map_err(|_| malformed(s))?;
        HybridLogicalClock::from_parts(ts, counter, node_id).ok_or_else(|| malformed(s))
    }
}

fn malformed(raw: &str) -> Error {
    Error::new(ErrorKind::HeaderInvalid, format!("malformed clock stamp {raw:?}"))
        .with_property(mqrt_protocol::PROP_TIMESTAMP)
}

// ---------------------------------------------------------------------------
// Shared process-wide instance
// ---------------------------------------------------------------------------

/// Handle to the process-wide clock.
///
/// Cheap to clone; all clones share one value behind a mutex held only across
/// non-suspending sections.
#[derive(Clone)]
pub struct SharedClock {
    inner: Arc<Mutex<HybridLogicalClock>>,
    max_drift: Duration,
}

impl SharedClock {
    /// Create the clock for this process.  `node_id` must be non-empty and is
    /// fixed for the lifetime of the process.
    pub fn new(node_id: impl Into<String>) -> Result<Self> {
        Self::with_max_drift(node_id, DEFAULT_MAX_DRIFT)
    }

    pub fn with_max_drift(node_id: impl Into<String>, max_drift: Duration) -> Result<Self> {
        let node_id = node_id.into();
        if node_id.is_empty() {
            return Err(Error::shallow(ErrorKind::ConfigurationInvalid, "clock node id is empty"));
        }
        Ok(SharedClock {
            inner: Arc::new(Mutex::new(HybridLogicalClock::new(node_id))),
            max_drift,
        })
    }

    pub fn node_id(&self) -> String {
        self.lock().node_id.clone()
    }

    /// Current value without advancing the clock.
    pub fn snapshot(&self) -> HybridLogicalClock {
        self.lock().clone()
    }

    /// Tick the clock and return the stamp to attach to an outbound message.
    pub fn stamp(&self) -> Result<HybridLogicalClock> {
        self.stamp_at(Utc::now())
    }

    /// Merge a remote stamp into the local clock.
    ///
    /// A stamp carrying our own node id is ignored.  A remote timestamp more
    /// than `max_drift` away from the wall clock is rejected; the caller must
    /// not deliver the containing message.
    pub fn observe(&self, remote: &HybridLogicalClock) -> Result<()> {
        self.observe_at(remote, Utc::now())
    }

    pub(crate) fn stamp_at(&self, now: DateTime<Utc>) -> Result<HybridLogicalClock> {
        let now = truncate_ms(now);
        let mut local = self.lock();
        if now > local.timestamp {
            local.timestamp = now;
            local.counter = 0;
        } else {
            match local.counter.checked_add(1) {
                Some(next) => local.counter = next,
                None => return Err(counter_overflow(&local.node_id)),
            }
        }
        Ok(local.clone())
    }

    pub(crate) fn observe_at(&self, remote: &HybridLogicalClock, now: DateTime<Utc>) -> Result<()> {
        let now = truncate_ms(now);
        let mut local = self.lock();
        if remote.node_id == local.node_id {
            return Ok(());
        }
        let drift = (remote.timestamp - now).abs();
        if drift.num_milliseconds().unsigned_abs()
            > u64::try_from(self.max_drift.as_millis()).unwrap_or(u64::MAX)
        {
            return Err(Error::new(
                ErrorKind::StateInvalid,
                format!(
                    "clock drift exceeded: remote {} is {}ms from local wall clock",
                    remote,
                    drift.num_milliseconds()
                ),
            ));
        }
        let max_ts = local.timestamp.max(remote.timestamp).max(now);
        local.counter = match (max_ts == local.timestamp, max_ts == remote.timestamp) {
            (true, true) => local.counter.max(remote.counter),
            (true, false) => local.counter,
            (false, true) => remote.counter,
            (false, false) => 0,
        };
        local.timestamp = max_ts;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HybridLogicalClock> {
        // Lock poisoning cannot happen: no code path panics while holding it.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn counter_overflow(node_id: &str) -> Error {
    Error::new(
        ErrorKind::StateInvalid,
        format!("clock counter overflow on node {node_id:?}"),
    )
}

fn truncate_ms(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(t.timestamp_millis()).single().unwrap_or(t)
}
