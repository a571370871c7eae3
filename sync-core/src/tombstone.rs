//! Tombstone retention across reconciliation cycles.
//!
//! A deleted entry stays in the manifest as a tombstone until every
//! paired device has completed a reconciliation cycle that observed it.
//! Pruning earlier would let an out-of-date peer resurrect the deleted
//! data on its next sync.

use std::collections::{BTreeMap, BTreeSet};

use sync_types::{DeviceId, EntryId};

/// Tracks which paired devices still need to observe each tombstone.
#[derive(Debug, Clone, Default)]
pub struct TombstoneTracker {
    paired: BTreeSet<DeviceId>,
    /// Tombstone id → devices that have not yet completed a cycle with it.
    pending: BTreeMap<EntryId, BTreeSet<DeviceId>>,
}

impl TombstoneTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly paired device. It must observe every tombstone
    /// currently pending, including ones recorded before it paired.
    pub fn device_paired(&mut self, device_id: DeviceId) {
        if self.paired.insert(device_id) {
            for observers in self.pending.values_mut() {
                observers.insert(device_id);
            }
        }
    }

    /// Remove an unpaired device from all bookkeeping.
    pub fn device_unpaired(&mut self, device_id: DeviceId) {
        self.paired.remove(&device_id);
        for observers in self.pending.values_mut() {
            observers.remove(&device_id);
        }
    }

    /// Record a new tombstone. All currently paired devices must observe
    /// it before it becomes prunable.
    pub fn record(&mut self, entry_id: EntryId) {
        self.pending.insert(entry_id, self.paired.clone());
    }

    /// A device completed a full reconciliation cycle: every tombstone in
    /// the manifest it processed has now been observed by it.
    pub fn cycle_completed(&mut self, device_id: DeviceId) {
        for observers in self.pending.values_mut() {
            observers.remove(&device_id);
        }
    }

    /// Whether a tombstone is still being retained.
    pub fn is_retained(&self, entry_id: &EntryId) -> bool {
        self.pending.contains_key(entry_id)
    }

    /// Remove and return the tombstones every paired device has observed.
    pub fn prune(&mut self) -> Vec<EntryId> {
        let done: Vec<EntryId> = self
            .pending
            .iter()
            .filter(|(_, observers)| observers.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &done {
            self.pending.remove(id);
        }
        done
    }
}
