// ── Device registry ──
//
// Keyed mirror of authoritative device state. The whole map is one
// immutable snapshot published through a `watch` channel, so readers
// never see a half-applied snapshot and every write is a single swap.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tokio::sync::watch;
use tracing::warn;

use crate::model::{DeviceId, DevicePatch, DeviceState, ExecutionState};

/// Immutable registry contents, in server order.
pub type DeviceMap = Arc<IndexMap<DeviceId, Arc<DeviceState>>>;

/// What a full snapshot changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotOutcome {
    pub added: Vec<DeviceId>,
    pub removed: Vec<DeviceId>,
    pub anomalies: usize,
}

/// What a single delta changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaOutcome {
    pub created: bool,
    pub anomaly: bool,
}

pub struct DeviceRegistry {
    snapshot: watch::Sender<DeviceMap>,
    anomalies: AtomicU64,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(IndexMap::new()));
        Self {
            snapshot,
            anomalies: AtomicU64::new(0),
        }
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Replace the whole registry. The snapshot wins over every local record.
    pub fn apply_snapshot(&self, devices: Vec<DeviceState>) -> SnapshotOutcome {
        let previous = self.snapshot();
        let mut next = IndexMap::with_capacity(devices.len());
        let mut outcome = SnapshotOutcome::default();

        for device in devices {
            match previous.get(&device.id) {
                Some(prev) => {
                    let (from, to) = (prev.execution_state, device.execution_state);
                    if self.check_transition(&device.id, from, to) {
                        outcome.anomalies += 1;
                    }
                }
                None => outcome.added.push(device.id.clone()),
            }
            next.insert(device.id.clone(), Arc::new(device));
        }

        outcome.removed = previous
            .keys()
            .filter(|id| !next.contains_key(*id))
            .cloned()
            .collect();

        self.snapshot.send_replace(Arc::new(next));
        outcome
    }

    /// Upsert one record. Unknown ids are created from defaults plus `patch`.
    pub fn apply_delta(
        &self,
        id: &DeviceId,
        patch: &DevicePatch,
        at: Option<DateTime<Utc>>,
    ) -> DeltaOutcome {
        let previous = self.snapshot();
        let mut outcome = DeltaOutcome {
            created: false,
            anomaly: false,
        };

        let updated = match previous.get(id) {
            Some(prev) => {
                let mut state = DeviceState::clone(prev);
                patch.apply_to(&mut state, at);
                outcome.anomaly =
                    self.check_transition(id, prev.execution_state, state.execution_state);
                state
            }
            None => {
                outcome.created = true;
                patch.clone().into_state(id.clone(), at)
            }
        };

        let mut next = IndexMap::clone(&previous);
        next.insert(id.clone(), Arc::new(updated));
        self.snapshot.send_replace(Arc::new(next));
        outcome
    }

    /// Drop one record. Returns it if it existed.
    pub fn remove(&self, id: &DeviceId) -> Option<Arc<DeviceState>> {
        let previous = self.snapshot();
        if !previous.contains_key(id) {
            return None;
        }
        let mut next = IndexMap::clone(&previous);
        let removed = next.shift_remove(id);
        self.snapshot.send_replace(Arc::new(next));
        removed
    }

    /// Forget everything. Used when the connection drops.
    pub fn clear(&self) {
        self.snapshot.send_if_modified(|map| {
            if map.is_empty() {
                return false;
            }
            *map = Arc::new(IndexMap::new());
            true
        });
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn get(&self, id: &DeviceId) -> Option<Arc<DeviceState>> {
        self.snapshot.borrow().get(id).cloned()
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.snapshot.borrow().contains_key(id)
    }

    pub fn all(&self) -> Vec<Arc<DeviceState>> {
        self.snapshot.borrow().values().cloned().collect()
    }

    /// Current contents (cheap `Arc` clone).
    pub fn snapshot(&self) -> DeviceMap {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceMap> {
        self.snapshot.subscribe()
    }

    pub fn len(&self) -> usize {
        self.snapshot.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.borrow().is_empty()
    }

    /// Illegal transitions accepted from the server so far.
    pub fn anomaly_count(&self) -> u64 {
        self.anomalies.load(Ordering::Relaxed)
    }

    /// Returns `true` (and records an anomaly) when `from -> to` is illegal.
    fn check_transition(&self, id: &DeviceId, from: ExecutionState, to: ExecutionState) -> bool {
        if from.allows_transition(to) {
            return false;
        }
        self.anomalies.fetch_add(1, Ordering::Relaxed);
        warn!(
            device_id = %id,
            %from,
            %to,
            "illegal execution state transition accepted from server"
        );
        true
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
