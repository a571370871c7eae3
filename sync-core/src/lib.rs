//! # sync-core
//!
//! Pure logic for VaultMesh (no I/O, instant tests).
//!
//! This crate implements the protocol logic and state machines for vault
//! synchronization without any network or disk I/O:
//!
//! - [`pairing`] - invitation, challenge-response, trust bootstrap
//! - [`diff`] - manifest diffing and divergence classification
//! - [`conflict`] - conflict resolution policies with deterministic tie-breaks
//! - [`version`] - per-device manifest version acceptance
//! - [`tombstone`] - delete-marker retention across reconciliation cycles
//! - [`orchestrator`] - the sync attempt state machine
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (network, vault storage) is performed by `sync-client`,
//! which interprets the actions produced by these state machines.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod conflict;
pub mod diff;
pub mod orchestrator;
pub mod pairing;
pub mod tombstone;
pub mod version;

pub use conflict::{
    ConflictError, ConflictKind, ConflictResolution, ConflictSummary, MergeFields,
    ResolvedConflict, SyncConflict, MERGE_DATA_FIELD,
};
pub use diff::{diff, validate_manifest, ManifestDiff, ManifestError};
pub use orchestrator::{
    Action, Event, PairingPhase, StatusEvent, SyncState, MAX_MANIFEST_ATTEMPTS,
};
pub use pairing::{
    accept_invitation, create_invitation, decode_scanned_invitation, verify_response,
    PairingError, DEFAULT_INVITATION_TTL,
};
pub use tombstone::TombstoneTracker;
pub use version::VersionTracker;
