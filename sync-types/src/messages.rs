//! Protocol messages.
//!
//! [`KeyExchangeOffer`] and [`KeyExchangeAnswer`] travel in cleartext
//! (they carry only public values). [`SyncMessage`] is the inner payload
//! that gets encrypted into an [`EncryptedSyncPacket`] before it is
//! wrapped in a [`Frame`].
//!
//! [`EncryptedSyncPacket`]: crate::EncryptedSyncPacket
//! [`Frame`]: crate::Frame

use serde::{Deserialize, Serialize};

use crate::{DeviceId, EntryId, ExchangeId, SyncEntry, SyncManifest, WireError};

/// First half of an ephemeral key exchange.
///
/// Carries the initiator's fresh x25519 ephemeral public key. A new key
/// pair is generated for every exchange; offers are never reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchangeOffer {
    /// Identifies this exchange until it completes.
    pub exchange_id: ExchangeId,
    /// The initiating device.
    pub device_id: DeviceId,
    /// The initiator's ephemeral public key.
    pub ephemeral_public_key: [u8; 32],
}

/// Second half of an ephemeral key exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchangeAnswer {
    /// Echoes the offer's exchange id.
    pub exchange_id: ExchangeId,
    /// The answering device.
    pub device_id: DeviceId,
    /// The responder's ephemeral public key.
    pub ephemeral_public_key: [u8; 32],
}

/// The inner protocol messages exchanged over an established session.
///
/// These are serialized to MessagePack and encrypted before transmission;
/// the transport only ever sees ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncMessage {
    /// A full manifest snapshot for one vault.
    Manifest(SyncManifest),
    /// Request the payloads of specific entries.
    EntryRequest {
        /// The entries being requested.
        ids: Vec<EntryId>,
    },
    /// One entry's manifest record plus its payload bytes.
    EntryData {
        /// The manifest record for the entry.
        entry: SyncEntry,
        /// The entry payload (already vault-encrypted at rest; opaque here).
        payload: Vec<u8>,
    },
    /// The receiver has applied all transfers for this round.
    CommitAck {
        /// The manifest version the sender committed at.
        version: u64,
    },
    /// Ratchet both sides' session keys forward to the given epoch.
    Rotate {
        /// The rotation counter after this ratchet step.
        rotation_count: u32,
    },
    /// Graceful session teardown, so the peer does not have to infer
    /// closure from decrypt failures.
    SessionClose {
        /// Optional human-readable reason.
        reason: Option<String>,
    },
}

impl SyncMessage {
    /// Serialize to MessagePack bytes (the plaintext handed to the AEAD).
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec(self).map_err(WireError::Serialization)
    }

    /// Deserialize from decrypted MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        rmp_serde::from_slice(bytes).map_err(WireError::Deserialization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EntryAction, VaultId};
    use std::collections::BTreeMap;

    #[test]
    fn key_exchange_offer_roundtrip() {
        let offer = KeyExchangeOffer {
            exchange_id: ExchangeId::random(),
            device_id: DeviceId::random(),
            ephemeral_public_key: [0x11; 32],
        };
        let bytes = rmp_serde::to_vec(&offer).unwrap();
        let restored: KeyExchangeOffer = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(offer, restored);
    }

    #[test]
    fn manifest_message_roundtrip() {
        let manifest = SyncManifest::new(
            DeviceId::random(),
            VaultId::random(),
            3,
            1000,
            BTreeMap::new(),
        );
        let msg = SyncMessage::Manifest(manifest.clone());
        let bytes = msg.to_bytes().unwrap();
        let restored = SyncMessage::from_bytes(&bytes).unwrap();
        assert_eq!(restored, SyncMessage::Manifest(manifest));
    }

    #[test]
    fn entry_request_roundtrip() {
        let msg = SyncMessage::EntryRequest {
            ids: vec![EntryId::new("e1"), EntryId::new("e2")],
        };
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(SyncMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn entry_data_roundtrip() {
        let msg = SyncMessage::EntryData {
            entry: SyncEntry {
                id: EntryId::new("e1"),
                action: EntryAction::Update,
                timestamp: 42,
                data_hash: Some("abcd".into()),
                data_size: Some(4),
                metadata: None,
            },
            payload: vec![9, 9, 9, 9],
        };
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(SyncMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn session_close_roundtrip() {
        let msg = SyncMessage::SessionClose {
            reason: Some("sync complete".into()),
        };
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(SyncMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let result = SyncMessage::from_bytes(&[0xFF, 0x00, 0x13, 0x37]);
        assert!(matches!(result, Err(WireError::Deserialization(_))));
    }
}
