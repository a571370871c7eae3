//! Manifest diffing - computing the minimal exchange between two devices.
//!
//! Given the local and remote manifest snapshots of one vault, the diff
//! decides per entry id whether the entry must be sent, fetched, skipped,
//! or surfaced as a conflict. Output ordering is ascending entry id, so
//! repeated runs over the same two manifests produce identical results -
//! required for idempotent retries.

use std::collections::BTreeSet;
use thiserror::Error;

use sync_types::{DeviceId, EntryAction, EntryId, SyncEntry, SyncManifest, MANIFEST_SCHEMA_VERSION};

use crate::conflict::{suggest, ConflictKind, SyncConflict};

/// Error type for manifest acceptance and diffing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    /// The manifest's version is at or below the last accepted one for
    /// the sending device (replay or out-of-date snapshot).
    #[error("stale manifest from {device_id}: version {version} <= last accepted {last_accepted}")]
    Stale {
        /// The device that sent the manifest.
        device_id: DeviceId,
        /// The version the manifest carried.
        version: u64,
        /// The highest version previously accepted from that device.
        last_accepted: u64,
    },

    /// The stored checksum does not match the entries map.
    #[error("manifest checksum mismatch")]
    ChecksumMismatch,

    /// The manifest uses an unknown schema version.
    #[error("unsupported manifest schema version: {0}")]
    UnsupportedVersion(u8),

    /// The manifest is structurally unusable.
    #[error("malformed manifest: {0}")]
    Malformed(String),
}

/// The result of diffing two manifests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    /// Entries only the local side has (excluding tombstones), ascending.
    pub to_send: Vec<EntryId>,
    /// Entries only the remote side has (excluding tombstones), ascending.
    pub to_receive: Vec<EntryId>,
    /// Entries both sides changed incompatibly, ascending by entry id.
    pub conflicts: Vec<SyncConflict>,
}

impl ManifestDiff {
    /// Whether the two manifests already agree on everything.
    pub fn is_empty(&self) -> bool {
        self.to_send.is_empty() && self.to_receive.is_empty() && self.conflicts.is_empty()
    }
}

/// Validate a received manifest before diffing against it.
///
/// Checks the schema version and recomputes the checksum over the entries
/// map. Stale-version rejection is the caller's job (it needs the
/// per-device acceptance state, see [`VersionTracker`]).
///
/// [`VersionTracker`]: crate::VersionTracker
pub fn validate_manifest(manifest: &SyncManifest) -> Result<(), ManifestError> {
    if manifest.schema_version != MANIFEST_SCHEMA_VERSION {
        return Err(ManifestError::UnsupportedVersion(manifest.schema_version));
    }
    if !manifest.verify_checksum() {
        return Err(ManifestError::ChecksumMismatch);
    }
    Ok(())
}

/// Diff two manifests of the same vault.
///
/// For every entry id present in either manifest:
/// - only local, not a tombstone → `to_send`
/// - only remote, not a tombstone → `to_receive`
/// - both, identical data hash → no-op (covers two tombstones)
/// - both, differing hash or action → classified conflict:
///   both creates → create/create; one side deleted → update/delete or
///   delete/update (local action first); otherwise update/update
pub fn diff(local: &SyncManifest, remote: &SyncManifest) -> ManifestDiff {
    let mut result = ManifestDiff::default();

    let ids: BTreeSet<&EntryId> = local.entries.keys().chain(remote.entries.keys()).collect();

    for id in ids {
        match (local.entries.get(id), remote.entries.get(id)) {
            (Some(ours), None) => {
                if !ours.is_tombstone() {
                    result.to_send.push(id.clone());
                }
            }
            (None, Some(theirs)) => {
                if !theirs.is_tombstone() {
                    result.to_receive.push(id.clone());
                }
            }
            (Some(ours), Some(theirs)) => {
                if ours.data_hash == theirs.data_hash {
                    continue;
                }
                if ours.is_tombstone() && theirs.is_tombstone() {
                    // Both already deleted - converged regardless of hashes
                    continue;
                }
                let kind = classify_pair(ours, theirs);
                result.conflicts.push(SyncConflict {
                    entry_id: id.clone(),
                    local: ours.clone(),
                    remote: theirs.clone(),
                    local_device: local.device_id,
                    remote_device: remote.device_id,
                    kind,
                    suggested: suggest(kind),
                });
            }
            (None, None) => unreachable!("id came from one of the two maps"),
        }
    }

    result
}

/// Classify a divergent pair. At most one side is a tombstone here.
fn classify_pair(ours: &SyncEntry, theirs: &SyncEntry) -> ConflictKind {
    match (ours.is_tombstone(), theirs.is_tombstone()) {
        (true, false) => ConflictKind::DeleteUpdate,
        (false, true) => ConflictKind::UpdateDelete,
        _ => {
            if ours.action == EntryAction::Create && theirs.action == EntryAction::Create {
                ConflictKind::CreateCreate
            } else {
                ConflictKind::UpdateUpdate
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{resolve, ConflictResolution};
    use std::collections::BTreeMap;
    use sync_types::VaultId;

    fn entry(id: &str, action: EntryAction, timestamp: u64, hash: Option<&str>) -> SyncEntry {
        SyncEntry {
            id: EntryId::new(id),
            action,
            timestamp,
            data_hash: hash.map(String::from),
            data_size: hash.map(|_| 64),
            metadata: None,
        }
    }

    fn manifest(device: DeviceId, items: Vec<SyncEntry>) -> SyncManifest {
        let entries: BTreeMap<EntryId, SyncEntry> =
            items.into_iter().map(|e| (e.id.clone(), e)).collect();
        SyncManifest::new(device, VaultId::random(), 1, 1_000, entries)
    }

    #[test]
    fn identical_manifests_diff_empty() {
        let device_a = DeviceId::random();
        let device_b = DeviceId::random();
        let items = vec![
            entry("e1", EntryAction::Update, 100, Some("h1")),
            entry("e2", EntryAction::Create, 200, Some("h2")),
        ];
        let local = manifest(device_a, items.clone());
        let remote = manifest(device_b, items);

        assert!(diff(&local, &remote).is_empty());
    }

    #[test]
    fn disjoint_manifests_split_cleanly() {
        // Disjoint sets of sizes 3 and 2: 3 to send, 2 to receive, no conflicts
        let local = manifest(
            DeviceId::random(),
            vec![
                entry("a1", EntryAction::Create, 1, Some("h1")),
                entry("a2", EntryAction::Create, 2, Some("h2")),
                entry("a3", EntryAction::Create, 3, Some("h3")),
            ],
        );
        let remote = manifest(
            DeviceId::random(),
            vec![
                entry("b1", EntryAction::Create, 4, Some("h4")),
                entry("b2", EntryAction::Create, 5, Some("h5")),
            ],
        );

        let result = diff(&local, &remote);
        assert_eq!(result.to_send.len(), 3);
        assert_eq!(result.to_receive.len(), 2);
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn output_is_ascending_by_entry_id() {
        let local = manifest(
            DeviceId::random(),
            vec![
                entry("z", EntryAction::Create, 1, Some("hz")),
                entry("a", EntryAction::Create, 2, Some("ha")),
                entry("m", EntryAction::Create, 3, Some("hm")),
            ],
        );
        let remote = manifest(DeviceId::random(), vec![]);

        let result = diff(&local, &remote);
        assert_eq!(
            result.to_send,
            vec![EntryId::new("a"), EntryId::new("m"), EntryId::new("z")]
        );
    }

    #[test]
    fn repeated_diffs_are_identical() {
        let local = manifest(
            DeviceId::random(),
            vec![
                entry("e1", EntryAction::Update, 100, Some("h1")),
                entry("e2", EntryAction::Update, 150, Some("x1")),
            ],
        );
        let remote = manifest(
            DeviceId::random(),
            vec![
                entry("e2", EntryAction::Update, 175, Some("x2")),
                entry("e3", EntryAction::Create, 200, Some("h3")),
            ],
        );

        let first = diff(&local, &remote);
        let second = diff(&local, &remote);
        assert_eq!(first, second);
    }

    #[test]
    fn diff_is_symmetric() {
        let a = manifest(
            DeviceId::random(),
            vec![
                entry("only-a", EntryAction::Create, 1, Some("ha")),
                entry("shared", EntryAction::Update, 100, Some("hs-a")),
            ],
        );
        let b = manifest(
            DeviceId::random(),
            vec![
                entry("only-b", EntryAction::Create, 2, Some("hb")),
                entry("shared", EntryAction::Update, 200, Some("hs-b")),
            ],
        );

        let forward = diff(&a, &b);
        let backward = diff(&b, &a);

        assert_eq!(forward.to_send, backward.to_receive);
        assert_eq!(forward.to_receive, backward.to_send);
        assert_eq!(forward.conflicts.len(), backward.conflicts.len());

        // Same conflict set with local/remote labels swapped
        let fwd = &forward.conflicts[0];
        let bwd = &backward.conflicts[0];
        assert_eq!(fwd.entry_id, bwd.entry_id);
        assert_eq!(fwd.local, bwd.remote);
        assert_eq!(fwd.remote, bwd.local);
    }

    #[test]
    fn both_updated_is_update_update() {
        let local = manifest(
            DeviceId::random(),
            vec![entry("e1", EntryAction::Update, 100, Some("h1"))],
        );
        let remote = manifest(
            DeviceId::random(),
            vec![entry("e1", EntryAction::Update, 200, Some("h2"))],
        );

        let result = diff(&local, &remote);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].kind, ConflictKind::UpdateUpdate);
        assert_eq!(
            result.conflicts[0].suggested,
            Some(ConflictResolution::LastWriterWins)
        );
    }

    #[test]
    fn update_against_remote_delete_resolves_to_the_later_delete() {
        // Local e1 updated at T1; remote e1 deleted at T2 > T1.
        // The diff yields one update/delete conflict and last-writer-wins
        // resolves to the deletion.
        let local = manifest(
            DeviceId::random(),
            vec![entry("e1", EntryAction::Update, 1_000, Some("h1"))],
        );
        let remote = manifest(
            DeviceId::random(),
            vec![entry("e1", EntryAction::Delete, 2_000, None)],
        );

        let result = diff(&local, &remote);
        assert_eq!(result.conflicts.len(), 1);
        let conflict = &result.conflicts[0];
        assert_eq!(conflict.kind, ConflictKind::UpdateDelete);

        let resolved = resolve(conflict, ConflictResolution::LastWriterWins, None).unwrap();
        assert_eq!(resolved.entry.action, EntryAction::Delete);
    }

    #[test]
    fn local_delete_against_remote_update_is_delete_update() {
        let local = manifest(
            DeviceId::random(),
            vec![entry("e1", EntryAction::Delete, 2_000, None)],
        );
        let remote = manifest(
            DeviceId::random(),
            vec![entry("e1", EntryAction::Update, 1_000, Some("h1"))],
        );

        let result = diff(&local, &remote);
        assert_eq!(result.conflicts[0].kind, ConflictKind::DeleteUpdate);
    }

    #[test]
    fn same_id_created_on_both_sides_is_create_create() {
        let local = manifest(
            DeviceId::random(),
            vec![entry("e1", EntryAction::Create, 100, Some("mine"))],
        );
        let remote = manifest(
            DeviceId::random(),
            vec![entry("e1", EntryAction::Create, 100, Some("theirs"))],
        );

        let result = diff(&local, &remote);
        assert_eq!(result.conflicts[0].kind, ConflictKind::CreateCreate);
        assert_eq!(result.conflicts[0].suggested, None);
    }

    #[test]
    fn local_only_tombstone_is_not_sent() {
        // The peer never had the entry; shipping the tombstone is pointless
        let local = manifest(
            DeviceId::random(),
            vec![entry("gone", EntryAction::Delete, 100, None)],
        );
        let remote = manifest(DeviceId::random(), vec![]);

        let result = diff(&local, &remote);
        assert!(result.is_empty());
    }

    #[test]
    fn matching_tombstones_are_converged() {
        let local = manifest(
            DeviceId::random(),
            vec![entry("gone", EntryAction::Delete, 100, None)],
        );
        let remote = manifest(
            DeviceId::random(),
            vec![entry("gone", EntryAction::Delete, 250, None)],
        );

        assert!(diff(&local, &remote).is_empty());
    }

    #[test]
    fn validate_accepts_well_formed_manifest() {
        let m = manifest(
            DeviceId::random(),
            vec![entry("e1", EntryAction::Update, 1, Some("h"))],
        );
        assert!(validate_manifest(&m).is_ok());
    }

    #[test]
    fn validate_rejects_checksum_mismatch() {
        let mut m = manifest(
            DeviceId::random(),
            vec![entry("e1", EntryAction::Update, 1, Some("h"))],
        );
        m.entries
            .insert(EntryId::new("e2"), entry("e2", EntryAction::Create, 2, None));
        assert_eq!(validate_manifest(&m), Err(ManifestError::ChecksumMismatch));
    }

    #[test]
    fn validate_rejects_unknown_schema() {
        let mut m = manifest(DeviceId::random(), vec![]);
        m.schema_version = 9;
        assert_eq!(
            validate_manifest(&m),
            Err(ManifestError::UnsupportedVersion(9))
        );
    }
}
