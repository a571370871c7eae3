//! Long-term device identity.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::DeviceId;

/// Capability map advertised by a device.
///
/// Keys are short lowercase names ("protocol", "vault_format", "cipher");
/// values are versions or suite identifiers. `BTreeMap` keeps serialization
/// order stable.
pub type Capabilities = BTreeMap<String, String>;

/// A device's long-term x25519 public identity key.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePublicKey([u8; 32]);

impl DevicePublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for DevicePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for DevicePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePublicKey({}..)", &self.to_string()[..8])
    }
}

/// The public identity of a device in the sync mesh.
///
/// Created once per installation. The public key is the long-term identity
/// key; session traffic never uses it for encryption (sessions run on
/// ephemeral keys), it only binds pairing exchanges to a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Stable device identifier.
    pub device_id: DeviceId,
    /// Long-term identity public key.
    pub public_key: DevicePublicKey,
    /// Advertised capabilities (protocol version, vault formats, cipher suites).
    pub capabilities: Capabilities,
}

impl DeviceIdentity {
    /// Create an identity with empty capabilities.
    pub fn new(device_id: DeviceId, public_key: DevicePublicKey) -> Self {
        Self {
            device_id,
            public_key,
            capabilities: Capabilities::new(),
        }
    }

    /// Add or replace a capability.
    pub fn with_capability(mut self, key: &str, value: &str) -> Self {
        self.capabilities.insert(key.to_string(), value.to_string());
        self
    }

    /// Look up a capability value.
    pub fn capability(&self, key: &str) -> Option<&str> {
        self.capabilities.get(key).map(String::as_str)
    }
}
