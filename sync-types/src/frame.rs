//! Frame - the outer wire wrapper for all transport messages.

use serde::{Deserialize, Serialize};

use crate::{EncryptedSyncPacket, KeyExchangeAnswer, KeyExchangeOffer, PairingResponse, WireError};

/// Wire protocol version carried by every frame; checked on decode.
pub const WIRE_VERSION: u8 = 1;

/// The payload variants a frame can carry.
///
/// Pairing and key-exchange payloads travel in cleartext (public values
/// only); everything after session establishment is an encrypted packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FramePayload {
    /// Answer to a scanned pairing invitation.
    PairingResponse(PairingResponse),
    /// First half of an ephemeral key exchange.
    KeyExchangeOffer(KeyExchangeOffer),
    /// Second half of an ephemeral key exchange.
    KeyExchangeAnswer(KeyExchangeAnswer),
    /// An encrypted protocol message.
    Packet(EncryptedSyncPacket),
}

/// The outer wrapper for every message sent over the device transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Wire protocol version (currently 1).
    pub version: u8,
    /// The carried payload.
    pub payload: FramePayload,
}

impl Frame {
    /// Wrap a payload in a current-version frame.
    pub fn new(payload: FramePayload) -> Self {
        Self {
            version: WIRE_VERSION,
            payload,
        }
    }

    /// Serialize to MessagePack bytes for the transport.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec(self).map_err(WireError::Serialization)
    }

    /// Deserialize from transport bytes, rejecting unknown versions.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let frame: Self = rmp_serde::from_slice(bytes).map_err(WireError::Deserialization)?;
        if frame.version != WIRE_VERSION {
            return Err(WireError::UnsupportedVersion(frame.version));
        }
        Ok(frame)
    }
}
