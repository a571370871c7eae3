//! The encrypted wire unit.

use serde::{Deserialize, Serialize};

use crate::{DeviceId, SessionId};

/// An encrypted protocol message in transit between two paired devices.
///
/// Produced by the session layer: the plaintext [`SyncMessage`] is
/// AEAD-encrypted under the session's encryption key, then the ciphertext
/// is authenticated with HMAC-SHA256 under the session's authentication
/// key. Receivers verify the HMAC before attempting decryption.
///
/// [`SyncMessage`]: crate::SyncMessage
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSyncPacket {
    /// The session this packet belongs to.
    pub session_id: SessionId,
    /// The sending device.
    pub device_id: DeviceId,
    /// XChaCha20-Poly1305 nonce (24 bytes, random per message).
    pub nonce: [u8; 24],
    /// The encrypted payload.
    pub ciphertext: Vec<u8>,
    /// HMAC-SHA256 over (session id, nonce, ciphertext).
    pub hmac: [u8; 32],
    /// Unix timestamp in milliseconds - informational only, not trusted.
    pub timestamp: u64,
}

impl std::fmt::Debug for EncryptedSyncPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedSyncPacket")
            .field("session_id", &self.session_id)
            .field("device_id", &self.device_id)
            .field("nonce", &"[REDACTED]")
            .field(
                "ciphertext",
                &format!("[{} bytes REDACTED]", self.ciphertext.len()),
            )
            .field("hmac", &"[REDACTED]")
            .field("timestamp", &self.timestamp)
            .finish()
    }
}
