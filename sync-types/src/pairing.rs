//! Out-of-band pairing payloads.
//!
//! A [`PairingInvitation`] travels from the inviting device to the scanning
//! device as a QR code: a plain JSON string, no additional framing, so any
//! external QR renderer/scanner can carry it. The [`PairingResponse`]
//! travels back over the network transport.
//!
//! The challenge-response logic that fills and verifies these payloads
//! lives in the core crate; this module is data and serialization only.

use serde::{Deserialize, Serialize};

use crate::{Capabilities, DeviceId, DevicePublicKey, WireError};

/// Schema version carried by pairing payloads; checked on decode.
pub const PAIRING_SCHEMA_VERSION: u8 = 1;

/// An invitation to pair, created by the inviting device and consumed
/// exactly once by a scanning device.
///
/// Invalid after `expires_at`. The protocol carries no replay counter
/// beyond expiry, so the creator must invalidate the invitation locally
/// as soon as one response has been accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingInvitation {
    /// Schema version (currently 1).
    pub version: u8,
    /// The inviting device.
    pub device_id: DeviceId,
    /// Human-readable name shown on the scanning device.
    pub device_name: String,
    /// Network address the scanning device should connect to.
    pub address: String,
    /// Port on `address`.
    pub port: u16,
    /// The inviter's long-term identity public key.
    pub public_key: DevicePublicKey,
    /// Freshness token (16 hex chars) the responder must answer to.
    pub challenge: String,
    /// Unix timestamp in milliseconds when the invitation was created.
    pub created_at: u64,
    /// Unix timestamp in milliseconds after which the invitation is invalid.
    pub expires_at: u64,
    /// The inviter's advertised capabilities.
    pub capabilities: Capabilities,
}

impl PairingInvitation {
    /// Encode as the QR payload: a plain JSON string.
    pub fn to_qr_string(&self) -> String {
        serde_json::to_string(self).expect("invitation serialization failed")
    }

    /// Decode from a scanned QR payload.
    pub fn from_qr_string(payload: &str) -> Result<Self, WireError> {
        let invitation: Self = serde_json::from_str(payload)?;
        if invitation.version != PAIRING_SCHEMA_VERSION {
            return Err(WireError::UnsupportedVersion(invitation.version));
        }
        Ok(invitation)
    }
}

/// The scanning device's answer to a [`PairingInvitation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingResponse {
    /// Schema version (currently 1).
    pub version: u8,
    /// The responding device.
    pub device_id: DeviceId,
    /// The responder's long-term identity public key.
    pub public_key: DevicePublicKey,
    /// Deterministic answer to the invitation challenge (16 hex chars).
    pub challenge_response: String,
    /// The responder's advertised capabilities.
    pub capabilities: Capabilities,
    /// Unix timestamp in milliseconds when the response was built.
    pub timestamp: u64,
}
