//! Vault store abstraction.
//!
//! The engine never touches the vault's storage format or its at-rest
//! encryption; it reads and writes opaque versioned records through this
//! trait. Payload bytes stay vault-encrypted end to end - the sync layer
//! wraps them in its own session encryption for transit and hands them
//! back untouched.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use sync_types::{DeviceId, EntryId, VaultId};

/// Vault store errors.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The entry does not exist.
    #[error("entry not found: {0}")]
    NotFound(EntryId),

    /// The underlying storage failed.
    #[error("storage error: {0}")]
    Storage(String),
}

/// One versioned vault record as the sync layer sees it.
///
/// `payload` is opaque (already encrypted at rest by the vault layer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultRecord {
    /// Entry identifier, stable across devices.
    pub id: EntryId,
    /// Opaque entry payload.
    pub payload: Vec<u8>,
    /// Unix timestamp in milliseconds of the last change.
    pub updated_at: u64,
    /// Per-entry revision counter (1 = newly created).
    pub revision: u64,
    /// Soft-deletion marker; deleted records stay as tombstones.
    pub deleted: bool,
    /// Set when the record came back from a deletion.
    pub restored: bool,
    /// Cleartext field hints used by per-field merge.
    pub metadata: Option<BTreeMap<String, String>>,
}

/// The four operations the sync engine requires from vault storage.
#[async_trait]
pub trait VaultStore: Send + Sync {
    /// Read one record.
    async fn read_entry(&self, id: &EntryId) -> Result<Option<VaultRecord>, VaultError>;

    /// Write (create or replace) one record.
    async fn write_entry(&self, id: &EntryId, record: VaultRecord) -> Result<(), VaultError>;

    /// List the entry ids of one vault.
    async fn list_entries(&self, vault_id: VaultId) -> Result<Vec<EntryId>, VaultError>;

    /// The device's stored manifest counter for one vault.
    async fn current_version(&self, vault_id: VaultId, device_id: DeviceId)
        -> Result<u64, VaultError>;
}

/// In-memory vault store for tests and examples. Holds a single vault.
#[derive(Debug, Default)]
pub struct MemoryVaultStore {
    entries: DashMap<EntryId, VaultRecord>,
    version: AtomicU64,
}

impl MemoryVaultStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record directly (test setup).
    pub fn insert(&self, record: VaultRecord) {
        self.entries.insert(record.id.clone(), record);
    }

    /// Convenience: insert a live record with the given payload.
    pub fn insert_plain(&self, id: &str, payload: &[u8], updated_at: u64) {
        self.insert(VaultRecord {
            id: EntryId::new(id),
            payload: payload.to_vec(),
            updated_at,
            revision: 1,
            deleted: false,
            restored: false,
            metadata: None,
        });
    }

    /// Mark an entry deleted (test setup).
    pub fn delete(&self, id: &str, deleted_at: u64) {
        if let Some(mut record) = self.entries.get_mut(&EntryId::new(id)) {
            record.deleted = true;
            record.restored = false;
            record.updated_at = deleted_at;
            record.revision += 1;
            record.payload.clear();
        }
    }

    /// Set the stored manifest counter (test setup).
    pub fn set_version(&self, version: u64) {
        self.version.store(version, Ordering::SeqCst);
    }

    /// Number of live (non-tombstone) entries.
    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.deleted).count()
    }
}

#[async_trait]
impl VaultStore for MemoryVaultStore {
    async fn read_entry(&self, id: &EntryId) -> Result<Option<VaultRecord>, VaultError> {
        Ok(self.entries.get(id).map(|e| e.clone()))
    }

    async fn write_entry(&self, id: &EntryId, record: VaultRecord) -> Result<(), VaultError> {
        self.entries.insert(id.clone(), record);
        Ok(())
    }

    async fn list_entries(&self, _vault_id: VaultId) -> Result<Vec<EntryId>, VaultError> {
        let mut ids: Vec<EntryId> = self.entries.iter().map(|e| e.id.clone()).collect();
        ids.sort();
        Ok(ids)
    }

    async fn current_version(
        &self,
        _vault_id: VaultId,
        _device_id: DeviceId,
    ) -> Result<u64, VaultError> {
        Ok(self.version.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_write_roundtrip() {
        let store = MemoryVaultStore::new();
        store.insert_plain("e1", b"payload", 1_000);

        let record = store.read_entry(&EntryId::new("e1")).await.unwrap().unwrap();
        assert_eq!(record.payload, b"payload");
        assert_eq!(record.revision, 1);
        assert!(!record.deleted);
    }

    #[tokio::test]
    async fn missing_entry_reads_none() {
        let store = MemoryVaultStore::new();
        assert!(store.read_entry(&EntryId::new("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_sorted() {
        let store = MemoryVaultStore::new();
        store.insert_plain("zeta", b"z", 1);
        store.insert_plain("alpha", b"a", 2);

        let ids = store.list_entries(VaultId::random()).await.unwrap();
        assert_eq!(ids, vec![EntryId::new("alpha"), EntryId::new("zeta")]);
    }

    #[tokio::test]
    async fn delete_leaves_a_tombstone() {
        let store = MemoryVaultStore::new();
        store.insert_plain("e1", b"payload", 1_000);
        store.delete("e1", 2_000);

        let record = store.read_entry(&EntryId::new("e1")).await.unwrap().unwrap();
        assert!(record.deleted);
        assert!(record.payload.is_empty());
        assert_eq!(record.revision, 2);
        assert_eq!(store.live_count(), 0);
        // Still listed - tombstones stay visible to the manifest builder
        assert_eq!(store.list_entries(VaultId::random()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn version_defaults_to_zero() {
        let store = MemoryVaultStore::new();
        let version = store
            .current_version(VaultId::random(), DeviceId::random())
            .await
            .unwrap();
        assert_eq!(version, 0);

        store.set_version(7);
        let version = store
            .current_version(VaultId::random(), DeviceId::random())
            .await
            .unwrap();
        assert_eq!(version, 7);
    }
}
