//! Sync manifests - per-device vault snapshots.
//!
//! A manifest is a device's declared view of one vault at one instant:
//! a map of entry id to last-known change, a monotonic per-device version,
//! and an integrity checksum. Manifests are never mutated after
//! construction; a new snapshot supersedes the old one.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::{DeviceId, EntryId, VaultId};

/// Schema version carried by every manifest; checked on decode.
pub const MANIFEST_SCHEMA_VERSION: u8 = 1;

/// The kind of change an entry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryAction {
    /// Entry was created since the last sync.
    Create,
    /// Entry was modified.
    Update,
    /// Entry was deleted (tombstone - retained so stale peers cannot
    /// resurrect the data).
    Delete,
    /// Entry was restored from a previous deletion.
    Restore,
}

impl EntryAction {
    /// String form used in checksums and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Restore => "restore",
        }
    }
}

/// One logical change to one vault record, as seen by one device at the
/// time the manifest was built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEntry {
    /// Entry identifier (stable across devices).
    pub id: EntryId,
    /// What happened to the entry.
    pub action: EntryAction,
    /// Unix timestamp in milliseconds of the change.
    pub timestamp: u64,
    /// SHA-256 hex of the entry payload. Absent for tombstones.
    pub data_hash: Option<String>,
    /// Payload size in bytes. Absent for tombstones.
    pub data_size: Option<u64>,
    /// Optional cleartext metadata (field-level hints for merge).
    pub metadata: Option<BTreeMap<String, String>>,
}

impl SyncEntry {
    /// Whether this entry is a delete tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.action == EntryAction::Delete
    }
}

/// A device's snapshot of one vault, used to compute what must be
/// exchanged with a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncManifest {
    /// Schema version (currently 1).
    pub schema_version: u8,
    /// The device that built this manifest.
    pub device_id: DeviceId,
    /// The vault this manifest describes.
    pub vault_id: VaultId,
    /// Monotonic per-device manifest counter. A received manifest with a
    /// version at or below the last accepted one for the same device is
    /// stale and must be rejected.
    pub version: u64,
    /// Unix timestamp in milliseconds when the snapshot was taken.
    pub timestamp: u64,
    /// Entry id to last-known change. `BTreeMap` keeps iteration (and
    /// therefore the checksum) deterministic.
    pub entries: BTreeMap<EntryId, SyncEntry>,
    /// SHA-256 hex over the entries map.
    pub checksum: String,
}

impl SyncManifest {
    /// Build a manifest snapshot. Computes the checksum over the entries.
    pub fn new(
        device_id: DeviceId,
        vault_id: VaultId,
        version: u64,
        timestamp: u64,
        entries: BTreeMap<EntryId, SyncEntry>,
    ) -> Self {
        let checksum = Self::compute_checksum(&entries);
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            device_id,
            vault_id,
            version,
            timestamp,
            entries,
            checksum,
        }
    }

    /// Compute the SHA-256 hex checksum over an entries map.
    ///
    /// Hashes each entry's identifying fields in ascending entry-id order,
    /// so two maps with the same content always produce the same digest.
    pub fn compute_checksum(entries: &BTreeMap<EntryId, SyncEntry>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"vaultmesh-manifest-v1");
        for (id, entry) in entries {
            hasher.update(id.as_str().as_bytes());
            hasher.update(entry.action.as_str().as_bytes());
            hasher.update(entry.timestamp.to_be_bytes());
            if let Some(hash) = &entry.data_hash {
                hasher.update(hash.as_bytes());
            }
            if let Some(size) = entry.data_size {
                hasher.update(size.to_be_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }

    /// Verify that the stored checksum matches the entries map.
    pub fn verify_checksum(&self) -> bool {
        Self::compute_checksum(&self.entries) == self.checksum
    }

    /// Number of delete tombstones in this manifest.
    pub fn tombstone_count(&self) -> usize {
        self.entries.values().filter(|e| e.is_tombstone()).count()
    }
}
