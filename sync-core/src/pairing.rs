//! Device pairing: invitation creation, challenge-response, verification.
//!
//! The pairing flow:
//! 1. Device A creates an invitation carrying a fresh challenge and
//!    displays it as a QR code
//! 2. Device B scans the invitation and answers the challenge with a
//!    response bound to its own identity key
//! 3. Device A recomputes the expected answer; exact match is the
//!    acceptance gate
//!
//! The challenge is a freshness token, not a cryptographic commitment:
//! the real session security comes from the ephemeral key exchange that
//! follows a verified pairing. No network I/O happens here - the
//! orchestrator owns the transport.

use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use sync_types::{
    DeviceIdentity, DevicePublicKey, PairingInvitation, PairingResponse, WireError,
    PAIRING_SCHEMA_VERSION,
};

/// Default invitation validity window (10 minutes).
pub const DEFAULT_INVITATION_TTL: Duration = Duration::from_secs(600);

/// Length of challenges and challenge responses in hex characters.
const CHALLENGE_HEX_LEN: usize = 16;

/// Error type for pairing operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingError {
    /// The invitation's validity window has passed.
    #[error("invitation has expired")]
    Expired,

    /// The challenge response did not match the expected value.
    #[error("challenge response mismatch")]
    ChallengeMismatch,

    /// The scanned payload is not a valid invitation.
    #[error("invalid invitation payload: {0}")]
    InvalidPayload(String),

    /// The invitation was created by an incompatible protocol version.
    #[error("unsupported invitation version: {0}")]
    UnsupportedVersion(u8),
}

/// Current time in Unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Derive a fresh challenge: the first 16 hex characters of
/// SHA-256(timestamp-millis ‖ random).
fn generate_challenge(now: u64) -> String {
    let mut random = [0u8; 16];
    getrandom::getrandom(&mut random).expect("getrandom failed");

    let mut hasher = Sha256::new();
    hasher.update(now.to_be_bytes());
    hasher.update(random);
    let digest = hex::encode(hasher.finalize());
    digest[..CHALLENGE_HEX_LEN].to_string()
}

/// Derive the expected answer to a challenge for a given responder key:
/// the first 16 hex characters of SHA-256(challenge ‖ responder public key).
fn challenge_response(challenge: &str, responder_key: &DevicePublicKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(challenge.as_bytes());
    hasher.update(responder_key.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..CHALLENGE_HEX_LEN].to_string()
}

/// Create a pairing invitation for the local device.
///
/// The invitation is valid for `ttl` from now and must be treated as
/// single-use by the caller: invalidate it locally as soon as one
/// response has been accepted.
pub fn create_invitation(
    identity: &DeviceIdentity,
    device_name: &str,
    address: &str,
    port: u16,
    ttl: Duration,
) -> PairingInvitation {
    let now = now_millis();
    PairingInvitation {
        version: PAIRING_SCHEMA_VERSION,
        device_id: identity.device_id,
        device_name: device_name.to_string(),
        address: address.to_string(),
        port,
        public_key: identity.public_key,
        challenge: generate_challenge(now),
        created_at: now,
        expires_at: now + ttl.as_millis() as u64,
        capabilities: identity.capabilities.clone(),
    }
}

/// Decode a scanned QR payload into an invitation.
pub fn decode_scanned_invitation(payload: &str) -> Result<PairingInvitation, PairingError> {
    PairingInvitation::from_qr_string(payload).map_err(|e| match e {
        WireError::UnsupportedVersion(v) => PairingError::UnsupportedVersion(v),
        other => PairingError::InvalidPayload(other.to_string()),
    })
}

/// Answer a scanned invitation with the local device's identity.
///
/// Fails with [`PairingError::Expired`] if the invitation's validity
/// window has passed.
pub fn accept_invitation(
    invitation: &PairingInvitation,
    identity: &DeviceIdentity,
) -> Result<PairingResponse, PairingError> {
    accept_invitation_at(invitation, identity, now_millis())
}

/// [`accept_invitation`] with an explicit clock, for deterministic tests.
pub fn accept_invitation_at(
    invitation: &PairingInvitation,
    identity: &DeviceIdentity,
    now: u64,
) -> Result<PairingResponse, PairingError> {
    if now >= invitation.expires_at {
        return Err(PairingError::Expired);
    }

    Ok(PairingResponse {
        version: PAIRING_SCHEMA_VERSION,
        device_id: identity.device_id,
        public_key: identity.public_key,
        challenge_response: challenge_response(&invitation.challenge, &identity.public_key),
        capabilities: identity.capabilities.clone(),
        timestamp: now,
    })
}

/// Verify a response against the invitation it answers.
///
/// Recomputes the expected challenge response from the responder's public
/// key; any mismatch fails the pairing. A response arriving after the
/// invitation expired fails regardless of its content.
pub fn verify_response(
    invitation: &PairingInvitation,
    response: &PairingResponse,
) -> Result<(), PairingError> {
    verify_response_at(invitation, response, now_millis())
}

/// [`verify_response`] with an explicit clock, for deterministic tests.
pub fn verify_response_at(
    invitation: &PairingInvitation,
    response: &PairingResponse,
    now: u64,
) -> Result<(), PairingError> {
    if now >= invitation.expires_at {
        return Err(PairingError::Expired);
    }

    let expected = challenge_response(&invitation.challenge, &response.public_key);
    if expected != response.challenge_response {
        return Err(PairingError::ChallengeMismatch);
    }

    Ok(())
}
