//! Manifest building and application over a vault store.
//!
//! The pure diff lives in `sync-core`; this module does the I/O half:
//! snapshotting the store into a manifest (hashing each payload, carrying
//! tombstones, assigning the next per-device version) and writing received
//! entries back.
//!
//! The vault store exposes only a read of the stored version counter, so
//! the engine owns the running counter: seeded from the store when opened,
//! advanced on every committed round.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sync_types::{DeviceId, EntryAction, EntryId, SyncEntry, SyncManifest, VaultId};

use crate::vault::{VaultError, VaultRecord, VaultStore};

/// Builds manifests from, and applies entries to, one vault.
pub struct ManifestEngine<S: VaultStore> {
    store: Arc<S>,
    vault_id: VaultId,
    device_id: DeviceId,
    /// Last committed manifest version for this device.
    local_version: AtomicU64,
}

impl<S: VaultStore> ManifestEngine<S> {
    /// Open an engine over a store, seeding the version counter from it.
    pub async fn open(
        store: Arc<S>,
        vault_id: VaultId,
        device_id: DeviceId,
    ) -> Result<Self, VaultError> {
        let stored = store.current_version(vault_id, device_id).await?;
        Ok(Self {
            store,
            vault_id,
            device_id,
            local_version: AtomicU64::new(stored),
        })
    }

    /// The vault this engine serves.
    pub fn vault_id(&self) -> VaultId {
        self.vault_id
    }

    /// The version the next built manifest will carry.
    pub fn pending_version(&self) -> u64 {
        self.local_version.load(Ordering::SeqCst) + 1
    }

    /// Advance the committed version after a successful round.
    pub fn commit_version(&self) -> u64 {
        self.local_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Snapshot the store into a manifest.
    ///
    /// Every record becomes one entry: live records carry their payload
    /// hash and size, deleted records become tombstones. The version is
    /// the committed counter plus one; building twice without a commit
    /// reuses the same version (idempotent retries).
    pub async fn build_manifest(&self) -> Result<SyncManifest, VaultError> {
        let mut entries: BTreeMap<EntryId, SyncEntry> = BTreeMap::new();

        for id in self.store.list_entries(self.vault_id).await? {
            let record = self
                .store
                .read_entry(&id)
                .await?
                .ok_or_else(|| VaultError::NotFound(id.clone()))?;
            entries.insert(id, entry_from_record(&record));
        }

        Ok(SyncManifest::new(
            self.device_id,
            self.vault_id,
            self.pending_version(),
            now_millis(),
            entries,
        ))
    }

    /// Read the payload bytes of a live entry for transfer.
    pub async fn read_payload(&self, id: &EntryId) -> Result<Vec<u8>, VaultError> {
        let record = self
            .store
            .read_entry(id)
            .await?
            .ok_or_else(|| VaultError::NotFound(id.clone()))?;
        Ok(record.payload)
    }

    /// Write a received entry into the store.
    ///
    /// The revision continues from whatever the store already holds, so a
    /// re-applied entry never looks older than the local copy.
    pub async fn apply_remote_entry(
        &self,
        entry: &SyncEntry,
        payload: Vec<u8>,
    ) -> Result<(), VaultError> {
        let revision = match self.store.read_entry(&entry.id).await? {
            Some(existing) => existing.revision + 1,
            None => 1,
        };

        let record = VaultRecord {
            id: entry.id.clone(),
            payload,
            updated_at: entry.timestamp,
            revision,
            deleted: entry.is_tombstone(),
            restored: entry.action == EntryAction::Restore,
            metadata: entry.metadata.clone(),
        };

        self.store.write_entry(&entry.id, record).await
    }
}

impl<S: VaultStore> std::fmt::Debug for ManifestEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestEngine")
            .field("vault_id", &self.vault_id)
            .field("device_id", &self.device_id)
            .field("local_version", &self.local_version.load(Ordering::SeqCst))
            .finish()
    }
}

/// SHA-256 hex of an entry payload.
pub fn hash_payload(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

fn entry_from_record(record: &VaultRecord) -> SyncEntry {
    let action = if record.deleted {
        EntryAction::Delete
    } else if record.restored {
        EntryAction::Restore
    } else if record.revision == 1 {
        EntryAction::Create
    } else {
        EntryAction::Update
    };

    let (data_hash, data_size) = if record.deleted {
        (None, None)
    } else {
        (
            Some(hash_payload(&record.payload)),
            Some(record.payload.len() as u64),
        )
    };

    SyncEntry {
        id: record.id.clone(),
        action,
        timestamp: record.updated_at,
        data_hash,
        data_size,
        metadata: record.metadata.clone(),
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::MemoryVaultStore;

    async fn engine_with(store: Arc<MemoryVaultStore>) -> ManifestEngine<MemoryVaultStore> {
        ManifestEngine::open(store, VaultId::random(), DeviceId::random())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn manifest_covers_live_and_deleted_entries() {
        let store = Arc::new(MemoryVaultStore::new());
        store.insert_plain("alive", b"data", 1_000);
        store.insert_plain("gone", b"old", 500);
        store.delete("gone", 2_000);

        let engine = engine_with(store).await;
        let manifest = engine.build_manifest().await.unwrap();

        assert_eq!(manifest.entries.len(), 2);
        assert_eq!(manifest.tombstone_count(), 1);

        let alive = &manifest.entries[&EntryId::new("alive")];
        assert_eq!(alive.action, EntryAction::Create);
        assert_eq!(alive.data_hash.as_deref(), Some(hash_payload(b"data").as_str()));
        assert_eq!(alive.data_size, Some(4));

        let gone = &manifest.entries[&EntryId::new("gone")];
        assert!(gone.is_tombstone());
        assert!(gone.data_hash.is_none());
        assert_eq!(gone.timestamp, 2_000);
    }

    #[tokio::test]
    async fn version_is_stored_counter_plus_one() {
        let store = Arc::new(MemoryVaultStore::new());
        store.set_version(6);

        let engine = engine_with(store).await;
        let manifest = engine.build_manifest().await.unwrap();
        assert_eq!(manifest.version, 7);
    }

    #[tokio::test]
    async fn rebuilds_reuse_the_version_until_commit() {
        let store = Arc::new(MemoryVaultStore::new());
        let engine = engine_with(store).await;

        assert_eq!(engine.build_manifest().await.unwrap().version, 1);
        assert_eq!(engine.build_manifest().await.unwrap().version, 1);

        assert_eq!(engine.commit_version(), 1);
        assert_eq!(engine.build_manifest().await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn checksum_is_valid_on_built_manifests() {
        let store = Arc::new(MemoryVaultStore::new());
        store.insert_plain("e1", b"one", 1);
        store.insert_plain("e2", b"two", 2);

        let engine = engine_with(store).await;
        let manifest = engine.build_manifest().await.unwrap();
        assert!(manifest.verify_checksum());
    }

    #[tokio::test]
    async fn apply_creates_then_updates() {
        let store = Arc::new(MemoryVaultStore::new());
        let engine = engine_with(store.clone()).await;

        let entry = SyncEntry {
            id: EntryId::new("e1"),
            action: EntryAction::Create,
            timestamp: 1_000,
            data_hash: Some(hash_payload(b"v1")),
            data_size: Some(2),
            metadata: None,
        };
        engine.apply_remote_entry(&entry, b"v1".to_vec()).await.unwrap();

        let record = store.read_entry(&EntryId::new("e1")).await.unwrap().unwrap();
        assert_eq!(record.payload, b"v1");
        assert_eq!(record.revision, 1);

        let update = SyncEntry {
            action: EntryAction::Update,
            timestamp: 2_000,
            data_hash: Some(hash_payload(b"v2")),
            ..entry
        };
        engine.apply_remote_entry(&update, b"v2".to_vec()).await.unwrap();

        let record = store.read_entry(&EntryId::new("e1")).await.unwrap().unwrap();
        assert_eq!(record.payload, b"v2");
        assert_eq!(record.revision, 2);
        assert_eq!(record.updated_at, 2_000);
    }

    #[tokio::test]
    async fn apply_tombstone_deletes() {
        let store = Arc::new(MemoryVaultStore::new());
        store.insert_plain("e1", b"data", 1_000);
        let engine = engine_with(store.clone()).await;

        let tombstone = SyncEntry {
            id: EntryId::new("e1"),
            action: EntryAction::Delete,
            timestamp: 3_000,
            data_hash: None,
            data_size: None,
            metadata: None,
        };
        engine
            .apply_remote_entry(&tombstone, Vec::new())
            .await
            .unwrap();

        let record = store.read_entry(&EntryId::new("e1")).await.unwrap().unwrap();
        assert!(record.deleted);
        assert_eq!(record.revision, 2);
        assert_eq!(store.live_count(), 0);
    }

    #[tokio::test]
    async fn read_payload_of_missing_entry_fails() {
        let store = Arc::new(MemoryVaultStore::new());
        let engine = engine_with(store).await;
        assert!(matches!(
            engine.read_payload(&EntryId::new("ghost")).await,
            Err(VaultError::NotFound(_))
        ));
    }
}
