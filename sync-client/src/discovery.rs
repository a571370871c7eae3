//! Device discovery feed.
//!
//! Discovery itself (mDNS, BLE, manual entry) is an external collaborator;
//! the engine consumes whatever peers the injected service reports. The
//! service is an explicitly constructed instance handed to the
//! orchestrator - no global singletons - and can be reset or reconfigured
//! through its own methods.

use async_trait::async_trait;
use std::sync::Mutex;

use sync_types::{Capabilities, DeviceId};

/// A nearby device as reported by the discovery layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    /// The peer's device id.
    pub device_id: DeviceId,
    /// Network address the peer listens on.
    pub address: String,
    /// Port on `address`.
    pub port: u16,
    /// Capabilities the peer advertises.
    pub capabilities: Capabilities,
}

/// Source of nearby-device announcements.
#[async_trait]
pub trait DiscoveryService: Send + Sync {
    /// The peers currently visible.
    async fn peers(&self) -> Vec<DiscoveredPeer>;

    /// Drop all cached announcements (e.g. after a network change).
    async fn reset(&self);
}

/// A discovery service fed by explicit announcements.
///
/// Useful for tests and for UIs where the user enters a peer manually.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    peers: Mutex<Vec<DiscoveredPeer>>,
}

impl StaticDiscovery {
    /// Create an empty feed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce a peer. Re-announcing a device id replaces its record.
    pub fn announce(&self, peer: DiscoveredPeer) {
        let mut peers = self.peers.lock().unwrap();
        peers.retain(|p| p.device_id != peer.device_id);
        peers.push(peer);
    }

    /// Remove a peer from the feed.
    pub fn forget(&self, device_id: DeviceId) {
        self.peers.lock().unwrap().retain(|p| p.device_id != device_id);
    }
}

#[async_trait]
impl DiscoveryService for StaticDiscovery {
    async fn peers(&self) -> Vec<DiscoveredPeer> {
        self.peers.lock().unwrap().clone()
    }

    async fn reset(&self) {
        self.peers.lock().unwrap().clear();
    }
}
