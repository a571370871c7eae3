//! Conflict classification and resolution.
//!
//! Divergences found by the manifest diff are classified by the pair of
//! actions involved, offered a set of resolution policies, and resolved
//! deterministically: the same conflict with the same chosen policy always
//! produces the same converged entry, on both devices, which is what lets
//! a configured default policy resolve batches without user interaction.
//!
//! Timestamp ties under last-writer-wins are broken by a named rule:
//! the entry originating from the lexicographically smaller device id
//! wins. The rule is symmetric - both peers pick the same winner no
//! matter which side they call "local".

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use sync_types::{DeviceId, EntryId, SyncEntry};

/// Reserved merge field name selecting the entry payload source.
pub const MERGE_DATA_FIELD: &str = "data";

/// How two divergent copies of one entry disagree.
///
/// Named local-action-first: `UpdateDelete` means the local side updated
/// while the remote side deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictKind {
    /// Both sides modified the entry.
    UpdateUpdate,
    /// Local modified, remote deleted.
    UpdateDelete,
    /// Local deleted, remote modified.
    DeleteUpdate,
    /// Both sides independently created an entry with the same id.
    CreateCreate,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UpdateUpdate => "update/update",
            Self::UpdateDelete => "update/delete",
            Self::DeleteUpdate => "delete/update",
            Self::CreateCreate => "create/create",
        };
        write!(f, "{}", name)
    }
}

/// A resolution policy for one conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Keep the local entry.
    UseLocal,
    /// Take the remote entry.
    UseRemote,
    /// Combine both entries field by field.
    Merge,
    /// Defer to an interactive choice; cannot be applied directly.
    UserChoice,
    /// The strictly later timestamp wins; ties go to the smaller device id.
    LastWriterWins,
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UseLocal => "use-local",
            Self::UseRemote => "use-remote",
            Self::Merge => "merge",
            Self::UserChoice => "user-choice",
            Self::LastWriterWins => "last-writer-wins",
        };
        write!(f, "{}", name)
    }
}

/// Per-field merge selection: `true` = take the remote value. Fields not
/// present in the map keep the local value. The reserved field
/// [`MERGE_DATA_FIELD`] selects the payload source.
pub type MergeFields = BTreeMap<String, bool>;

/// One divergence between two manifests, for one entry.
///
/// Derived during a reconciliation pass; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConflict {
    /// The entry both sides disagree about.
    pub entry_id: EntryId,
    /// The local side's view.
    pub local: SyncEntry,
    /// The remote side's view.
    pub remote: SyncEntry,
    /// The device that built the local manifest.
    pub local_device: DeviceId,
    /// The device that built the remote manifest.
    pub remote_device: DeviceId,
    /// How the two sides disagree.
    pub kind: ConflictKind,
    /// A sensible default policy for this kind, if one exists.
    pub suggested: Option<ConflictResolution>,
}

/// Counts of conflicts per kind, for display and policy decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConflictSummary {
    /// Both sides modified.
    pub update_update: usize,
    /// Local modified, remote deleted.
    pub update_delete: usize,
    /// Local deleted, remote modified.
    pub delete_update: usize,
    /// Same id created on both sides.
    pub create_create: usize,
}

impl ConflictSummary {
    /// Total number of conflicts.
    pub fn total(&self) -> usize {
        self.update_update + self.update_delete + self.delete_update + self.create_create
    }
}

/// The outcome of resolving one conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConflict {
    /// The entry that was in conflict.
    pub entry_id: EntryId,
    /// The policy that was applied.
    pub resolution: ConflictResolution,
    /// The converged entry both devices will carry after the next round.
    pub entry: SyncEntry,
    /// Whether the applier should take the remote payload bytes.
    pub take_remote_payload: bool,
}

/// Error type for conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictError {
    /// The chosen policy is not applicable to this conflict kind.
    #[error("resolution {resolution} is not supported for {kind} conflicts")]
    UnsupportedResolution {
        /// The policy that was requested.
        resolution: ConflictResolution,
        /// The kind of the conflict it was requested for.
        kind: ConflictKind,
    },
}

/// Count conflicts per kind.
pub fn classify(conflicts: &[SyncConflict]) -> ConflictSummary {
    let mut summary = ConflictSummary::default();
    for conflict in conflicts {
        match conflict.kind {
            ConflictKind::UpdateUpdate => summary.update_update += 1,
            ConflictKind::UpdateDelete => summary.update_delete += 1,
            ConflictKind::DeleteUpdate => summary.delete_update += 1,
            ConflictKind::CreateCreate => summary.create_create += 1,
        }
    }
    summary
}

/// The resolution policies applicable to a conflict of the given kind.
///
/// Merge is never offered when one side is a deletion (there is nothing
/// to merge a record with), and last-writer-wins is not offered for
/// create collisions (neither side is a "later revision" of the other).
pub fn resolution_options_for(conflict: &SyncConflict) -> Vec<ConflictResolution> {
    match conflict.kind {
        ConflictKind::UpdateUpdate => vec![
            ConflictResolution::UseLocal,
            ConflictResolution::UseRemote,
            ConflictResolution::Merge,
            ConflictResolution::LastWriterWins,
        ],
        ConflictKind::UpdateDelete | ConflictKind::DeleteUpdate => vec![
            ConflictResolution::UseLocal,
            ConflictResolution::UseRemote,
            ConflictResolution::LastWriterWins,
        ],
        ConflictKind::CreateCreate => vec![
            ConflictResolution::UseLocal,
            ConflictResolution::UseRemote,
            ConflictResolution::Merge,
        ],
    }
}

/// A sensible default policy for a conflict kind, used to fill
/// [`SyncConflict::suggested`].
pub(crate) fn suggest(kind: ConflictKind) -> Option<ConflictResolution> {
    match kind {
        ConflictKind::UpdateUpdate
        | ConflictKind::UpdateDelete
        | ConflictKind::DeleteUpdate => Some(ConflictResolution::LastWriterWins),
        // Create collisions have no ordering to fall back on
        ConflictKind::CreateCreate => None,
    }
}

/// Apply a resolution policy to a conflict.
///
/// Rejected synchronously, before any state mutation, when the policy is
/// not in [`resolution_options_for`] the conflict's kind - including
/// `Merge` against a deletion side and `UserChoice` (which only names the
/// need for an interactive decision).
pub fn resolve(
    conflict: &SyncConflict,
    resolution: ConflictResolution,
    merge_fields: Option<&MergeFields>,
) -> Result<ResolvedConflict, ConflictError> {
    if !resolution_options_for(conflict).contains(&resolution) {
        return Err(ConflictError::UnsupportedResolution {
            resolution,
            kind: conflict.kind,
        });
    }

    let (entry, take_remote_payload) = match resolution {
        ConflictResolution::UseLocal => (conflict.local.clone(), false),
        ConflictResolution::UseRemote => (conflict.remote.clone(), true),
        ConflictResolution::LastWriterWins => {
            if remote_wins(conflict) {
                (conflict.remote.clone(), true)
            } else {
                (conflict.local.clone(), false)
            }
        }
        ConflictResolution::Merge => merge_entries(conflict, merge_fields),
        ConflictResolution::UserChoice => {
            // Filtered out by the options check above; UserChoice is never
            // in any options list.
            unreachable!("UserChoice passed the options check")
        }
    };

    Ok(ResolvedConflict {
        entry_id: conflict.entry_id.clone(),
        resolution,
        entry,
        take_remote_payload,
    })
}

/// Last-writer-wins decision: strictly later timestamp wins; on an exact
/// tie the side originating from the smaller device id wins.
fn remote_wins(conflict: &SyncConflict) -> bool {
    match conflict.remote.timestamp.cmp(&conflict.local.timestamp) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => conflict.remote_device < conflict.local_device,
    }
}

/// Build the merged entry: local is the base, remote values are taken for
/// the fields the caller flagged `true`.
fn merge_entries(
    conflict: &SyncConflict,
    merge_fields: Option<&MergeFields>,
) -> (SyncEntry, bool) {
    let empty = MergeFields::new();
    let fields = merge_fields.unwrap_or(&empty);

    let mut merged = conflict.local.clone();

    // The converged entry is newer than both inputs' views of it
    merged.timestamp = conflict.local.timestamp.max(conflict.remote.timestamp);

    let take_remote_payload = fields.get(MERGE_DATA_FIELD).copied().unwrap_or(false);
    if take_remote_payload {
        merged.data_hash = conflict.remote.data_hash.clone();
        merged.data_size = conflict.remote.data_size;
    }

    for (field, take_remote) in fields {
        if field == MERGE_DATA_FIELD || !take_remote {
            continue;
        }
        if let Some(value) = conflict
            .remote
            .metadata
            .as_ref()
            .and_then(|m| m.get(field))
        {
            merged
                .metadata
                .get_or_insert_with(BTreeMap::new)
                .insert(field.clone(), value.clone());
        }
    }

    (merged, take_remote_payload)
}
