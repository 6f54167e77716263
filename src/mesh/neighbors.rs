//! Live table of peer positions plus our own state.
//!
//! Self state and neighbors sit behind one lock so a [`MeshSnapshot`] is always a
//! consistent view of a single instant. The receive loop is the only writer; readers
//! (reporting, publish, persist, viewers) take short shared locks. Poisoned locks are
//! recovered rather than propagated since every write replaces whole entries.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// This node's identity and position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfState {
    pub id: String,
    pub x: f64,
    pub y: f64,
}

impl SelfState {
    pub fn new(id: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            id: id.into(),
            x,
            y,
        }
    }
}

/// Last known state of one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerState {
    pub id: String,
    pub x: f64,
    pub y: f64,
    #[serde(rename = "timestamp", with = "epoch_seconds")]
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "dBm")]
    pub signal_strength: Option<f64>,
}

impl PeerState {
    /// Time since the last accepted frame from this peer. Clock skew backwards reads as zero.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.updated_at).to_std().unwrap_or_default()
    }
}

/// Timestamps on the wire to viewers and on disk are Unix seconds as a float,
/// with microsecond resolution.
mod epoch_seconds {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(at.timestamp_micros() as f64 / 1_000_000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() {
            return Err(de::Error::custom("timestamp is not a finite number"));
        }
        DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64)
            .ok_or_else(|| de::Error::custom(format!("timestamp {} out of range", secs)))
    }
}

/// Self plus all neighbors at one instant; the value handed to publishers and persisters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshSnapshot {
    #[serde(rename = "self")]
    pub self_state: SelfState,
    pub neighbors: Vec<PeerState>,
}

impl MeshSnapshot {
    pub fn neighbor(&self, id: &str) -> Option<&PeerState> {
        self.neighbors.iter().find(|p| p.id == id)
    }
}

#[derive(Debug)]
struct TableInner {
    self_state: SelfState,
    peers: HashMap<String, PeerState>,
}

#[derive(Debug)]
pub struct NeighborTable {
    inner: RwLock<TableInner>,
}

impl NeighborTable {
    pub fn new(self_state: SelfState) -> Self {
        Self {
            inner: RwLock::new(TableInner {
                self_state,
                peers: HashMap::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, TableInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, TableInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace any entry for `peer.id`. Filtering our own id is the caller's job.
    pub fn upsert(&self, peer: PeerState) {
        self.write().peers.insert(peer.id.clone(), peer);
    }

    /// Consistent copy of self and all neighbors, ordered by peer id.
    pub fn snapshot(&self) -> MeshSnapshot {
        let guard = self.read();
        let mut neighbors: Vec<PeerState> = guard.peers.values().cloned().collect();
        let self_state = guard.self_state.clone();
        drop(guard);
        neighbors.sort_by(|a, b| a.id.cmp(&b.id));
        MeshSnapshot {
            self_state,
            neighbors,
        }
    }

    pub fn self_state(&self) -> SelfState {
        self.read().self_state.clone()
    }

    pub fn set_self_position(&self, x: f64, y: f64) {
        let mut guard = self.write();
        guard.self_state.x = x;
        guard.self_state.y = y;
    }

    pub fn get(&self, id: &str) -> Option<PeerState> {
        self.read().peers.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop peers whose last update is older than `max_age`. Returns the removed ids.
    pub fn evict_stale(&self, max_age: Duration, now: DateTime<Utc>) -> Vec<String> {
        let mut guard = self.write();
        let stale: Vec<String> = guard
            .peers
            .values()
            .filter(|p| p.age(now) > max_age)
            .map(|p| p.id.clone())
            .collect();
        for id in &stale {
            guard.peers.remove(id);
        }
        stale
    }
}
