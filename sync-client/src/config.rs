//! Configuration for the sync orchestrator.

use std::time::Duration;

use sync_core::conflict::ConflictResolution;
use sync_core::DEFAULT_INVITATION_TTL;

/// Configuration for a [`SyncOrchestrator`].
///
/// [`SyncOrchestrator`]: crate::SyncOrchestrator
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Human-readable device name shown in invitations.
    pub device_name: String,
    /// Validity window for pairing invitations.
    pub invitation_ttl: Duration,
    /// Deadline for one manifest exchange round before it counts as stalled.
    pub manifest_timeout: Duration,
    /// Completed rounds between key rotations (0 = never rotate).
    pub rotate_after_rounds: u32,
    /// How long an idle session is kept warm before closing.
    pub keep_warm: Duration,
    /// Policy applied to conflicts when no interactive choice is available.
    /// `None` keeps each conflict's suggested policy. Only symmetric
    /// policies (last-writer-wins) are honored during non-interactive
    /// rounds; directional choices need an interactive caller.
    pub default_resolution: Option<ConflictResolution>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            device_name: "vaultmesh device".to_string(),
            invitation_ttl: DEFAULT_INVITATION_TTL,
            manifest_timeout: Duration::from_secs(30),
            rotate_after_rounds: 1,
            keep_warm: Duration::from_secs(120),
            default_resolution: None,
        }
    }
}

impl SyncConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the device name.
    pub fn with_device_name(mut self, name: &str) -> Self {
        self.device_name = name.to_string();
        self
    }

    /// Set the invitation validity window.
    pub fn with_invitation_ttl(mut self, ttl: Duration) -> Self {
        self.invitation_ttl = ttl;
        self
    }

    /// Set the manifest exchange deadline.
    pub fn with_manifest_timeout(mut self, timeout: Duration) -> Self {
        self.manifest_timeout = timeout;
        self
    }

    /// Set the default conflict policy for non-interactive resolution.
    pub fn with_default_resolution(mut self, resolution: ConflictResolution) -> Self {
        self.default_resolution = Some(resolution);
        self
    }

    /// Set how many completed rounds run between key rotations.
    pub fn with_rotation_every(mut self, rounds: u32) -> Self {
        self.rotate_after_rounds = rounds;
        self
    }
}
