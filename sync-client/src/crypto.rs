//! Cryptographic primitives for VaultMesh.
//!
//! This module provides:
//! - x25519 key pairs: a long-term identity key per device, and fresh
//!   ephemeral keys per session exchange
//! - HKDF-SHA256 session-key derivation with independent "enc"/"auth"
//!   contexts and a rotation counter (ratchet)
//! - XChaCha20-Poly1305 encryption with 192-bit nonces
//! - HMAC-SHA256 packet authentication (encrypt-then-MAC)
//!
//! # Security Notes
//!
//! - XChaCha20 uses 192-bit nonces (24 bytes), safe for random generation
//! - Session keys derive from ephemeral shared secrets only; compromising
//!   the identity key never exposes session traffic
//! - All key material is zeroized on drop and redacted in Debug output

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use sync_types::DevicePublicKey;

/// Nonce size for XChaCha20-Poly1305 (192 bits = 24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Key size for all symmetric keys (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

/// HMAC-SHA256 output size (32 bytes).
pub const MAC_SIZE: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Crypto errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (authentication error).
    #[error("decryption failed: authentication error")]
    DecryptionFailed,

    /// Packet HMAC did not verify.
    #[error("packet authentication failed")]
    MacMismatch,

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),
}

/// A device's long-term x25519 identity key pair.
///
/// Used to bind pairing exchanges to a device. Session traffic never
/// uses this key for encryption.
pub struct IdentityKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl IdentityKeyPair {
    /// Generate a fresh identity key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The public half, in wire form.
    pub fn public_key(&self) -> DevicePublicKey {
        DevicePublicKey::from_bytes(*self.public.as_bytes())
    }
}

// Don't leak the secret in debug output
impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("secret", &"[REDACTED]")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish()
    }
}

/// One side of an in-flight ephemeral key exchange.
///
/// The secret can agree exactly once; it is consumed (and wiped) by
/// [`agree`], which is what makes past sessions unrecoverable.
///
/// [`agree`]: Self::agree
pub struct EphemeralExchange {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EphemeralExchange {
    /// Generate a fresh ephemeral key pair.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The public half, sent to the peer in cleartext.
    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Derive the shared session secret with the peer's ephemeral public
    /// key, consuming this side's ephemeral secret.
    pub fn agree(self, peer_public: &[u8; 32]) -> SessionSecret {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        SessionSecret(*shared.as_bytes())
    }
}

impl std::fmt::Debug for EphemeralExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralExchange")
            .field("secret", &"[REDACTED]")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish()
    }
}

/// The ephemeral shared secret a session's keys derive from.
///
/// Retained for the session's lifetime so keys can be ratcheted forward,
/// wiped on session close.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionSecret([u8; KEY_SIZE]);

impl SessionSecret {
    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Create from raw bytes (for testing).
    #[cfg(test)]
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionSecret([REDACTED])")
    }
}

/// A session's derived symmetric keys.
///
/// Separate subkeys for encryption and packet authentication, derived
/// from the session secret via HKDF-SHA256 under independent contexts.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    encryption: [u8; KEY_SIZE],
    authentication: [u8; KEY_SIZE],
}

impl SessionKeys {
    /// Derive the keys for a given rotation epoch.
    ///
    /// The rotation counter is mixed into the HKDF info, so each epoch's
    /// keys are independent: epoch N keys cannot be recomputed from epoch
    /// N+1 keys.
    pub fn derive(secret: &SessionSecret, rotation_count: u32) -> Self {
        let hkdf = Hkdf::<Sha256>::new(Some(b"vaultmesh-session-v1"), secret.as_bytes());

        let mut encryption = [0u8; KEY_SIZE];
        let mut authentication = [0u8; KEY_SIZE];

        let mut enc_info = b"enc".to_vec();
        enc_info.extend_from_slice(&rotation_count.to_le_bytes());
        hkdf.expand(&enc_info, &mut encryption)
            .expect("hkdf expand failed");

        let mut auth_info = b"auth".to_vec();
        auth_info.extend_from_slice(&rotation_count.to_le_bytes());
        hkdf.expand(&auth_info, &mut authentication)
            .expect("hkdf expand failed");

        Self {
            encryption,
            authentication,
        }
    }

    /// The encryption subkey.
    pub fn encryption_key(&self) -> &[u8; KEY_SIZE] {
        &self.encryption
    }

    /// The authentication subkey.
    pub fn authentication_key(&self) -> &[u8; KEY_SIZE] {
        &self.authentication
    }

    /// Whether both subkeys have been wiped.
    pub fn is_zeroized(&self) -> bool {
        self.encryption.iter().all(|&b| b == 0) && self.authentication.iter().all(|&b| b == 0)
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SessionKeys {{ encryption: [REDACTED], authentication: [REDACTED] }}"
        )
    }
}

/// Derive the 16-byte session tag both peers use as the session id.
///
/// Computed from the shared secret, so the two ends agree on the id
/// without sending it over the wire.
pub fn derive_session_tag(secret: &SessionSecret) -> [u8; 16] {
    let hkdf = Hkdf::<Sha256>::new(Some(b"vaultmesh-session-v1"), secret.as_bytes());
    let mut tag = [0u8; 16];
    hkdf.expand(b"sid", &mut tag).expect("hkdf expand failed");
    tag
}

/// Encrypt a plaintext with XChaCha20-Poly1305 under a random nonce.
///
/// Returns (ciphertext, nonce). The 192-bit nonce space makes random
/// generation safe without coordination.
pub fn aead_encrypt(
    key: &[u8; KEY_SIZE],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; NONCE_SIZE]), CryptoError> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    getrandom::getrandom(&mut nonce_bytes).expect("getrandom failed");
    let nonce = XNonce::from_slice(&nonce_bytes);

    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed("aead encrypt failed".into()))?;

    Ok((ciphertext, nonce_bytes))
}

/// Decrypt an XChaCha20-Poly1305 ciphertext.
pub fn aead_decrypt(
    key: &[u8; KEY_SIZE],
    ciphertext: &[u8],
    nonce: &[u8; NONCE_SIZE],
) -> Result<Vec<u8>, CryptoError> {
    let nonce = XNonce::from_slice(nonce);

    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Compute the packet HMAC over (context ‖ nonce ‖ ciphertext).
pub fn packet_mac(
    auth_key: &[u8; KEY_SIZE],
    context: &[u8],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
) -> [u8; MAC_SIZE] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(auth_key).expect("hmac accepts any key length");
    mac.update(context);
    mac.update(nonce);
    mac.update(ciphertext);
    mac.finalize().into_bytes().into()
}

/// Verify a packet HMAC in constant time.
pub fn verify_packet_mac(
    auth_key: &[u8; KEY_SIZE],
    context: &[u8],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    expected: &[u8; MAC_SIZE],
) -> Result<(), CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(auth_key).expect("hmac accepts any key length");
    mac.update(context);
    mac.update(nonce);
    mac.update(ciphertext);
    mac.verify_slice(expected).map_err(|_| CryptoError::MacMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_secret() -> SessionSecret {
        SessionSecret::from_bytes([0x42; 32])
    }

    // ===========================================
    // Key exchange
    // ===========================================

    #[test]
    fn ephemeral_agreement_matches_on_both_sides() {
        let alice = EphemeralExchange::generate();
        let bob = EphemeralExchange::generate();

        let alice_public = alice.public_bytes();
        let bob_public = bob.public_bytes();

        let alice_secret = alice.agree(&bob_public);
        let bob_secret = bob.agree(&alice_public);

        assert_eq!(alice_secret.as_bytes(), bob_secret.as_bytes());
    }

    #[test]
    fn ephemeral_keys_are_fresh_per_exchange() {
        let a = EphemeralExchange::generate();
        let b = EphemeralExchange::generate();
        assert_ne!(a.public_bytes(), b.public_bytes());
    }

    #[test]
    fn identity_keys_are_unique_per_generation() {
        let a = IdentityKeyPair::generate();
        let b = IdentityKeyPair::generate();
        assert_ne!(a.public_key(), b.public_key());
    }

    // ===========================================
    // Key derivation
    // ===========================================

    #[test]
    fn subkeys_are_distinct() {
        let keys = SessionKeys::derive(&test_secret(), 0);
        assert_ne!(keys.encryption_key(), keys.authentication_key());
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = SessionKeys::derive(&test_secret(), 0);
        let b = SessionKeys::derive(&test_secret(), 0);
        assert_eq!(a.encryption_key(), b.encryption_key());
        assert_eq!(a.authentication_key(), b.authentication_key());
    }

    #[test]
    fn rotation_produces_independent_keys() {
        let epoch0 = SessionKeys::derive(&test_secret(), 0);
        let epoch1 = SessionKeys::derive(&test_secret(), 1);
        assert_ne!(epoch0.encryption_key(), epoch1.encryption_key());
        assert_ne!(epoch0.authentication_key(), epoch1.authentication_key());
    }

    #[test]
    fn different_secrets_produce_different_keys() {
        let a = SessionKeys::derive(&SessionSecret::from_bytes([0x01; 32]), 0);
        let b = SessionKeys::derive(&SessionSecret::from_bytes([0x02; 32]), 0);
        assert_ne!(a.encryption_key(), b.encryption_key());
    }

    // ===========================================
    // AEAD
    // ===========================================

    #[test]
    fn aead_roundtrip() {
        let keys = SessionKeys::derive(&test_secret(), 0);
        let plaintext = b"vault entry payload";

        let (ciphertext, nonce) = aead_encrypt(keys.encryption_key(), plaintext).unwrap();
        let decrypted = aead_decrypt(keys.encryption_key(), &ciphertext, &nonce).unwrap();

        assert_eq!(plaintext.as_slice(), decrypted.as_slice());
    }

    #[test]
    fn nonces_are_random_per_message() {
        let keys = SessionKeys::derive(&test_secret(), 0);
        let (ct1, nonce1) = aead_encrypt(keys.encryption_key(), b"same").unwrap();
        let (ct2, nonce2) = aead_encrypt(keys.encryption_key(), b"same").unwrap();

        assert_ne!(nonce1, nonce2);
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn corrupted_ciphertext_fails_decryption() {
        let keys = SessionKeys::derive(&test_secret(), 0);
        let (mut ciphertext, nonce) = aead_encrypt(keys.encryption_key(), b"data").unwrap();
        ciphertext[0] ^= 0xFF;

        let result = aead_decrypt(keys.encryption_key(), &ciphertext, &nonce);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn wrong_key_fails_decryption() {
        let keys = SessionKeys::derive(&SessionSecret::from_bytes([0x01; 32]), 0);
        let other = SessionKeys::derive(&SessionSecret::from_bytes([0x02; 32]), 0);

        let (ciphertext, nonce) = aead_encrypt(keys.encryption_key(), b"data").unwrap();
        let result = aead_decrypt(other.encryption_key(), &ciphertext, &nonce);
        assert!(result.is_err());
    }

    #[test]
    fn empty_plaintext_encrypts() {
        let keys = SessionKeys::derive(&test_secret(), 0);
        let (ciphertext, nonce) = aead_encrypt(keys.encryption_key(), b"").unwrap();
        let decrypted = aead_decrypt(keys.encryption_key(), &ciphertext, &nonce).unwrap();
        assert!(decrypted.is_empty());
    }

    // ===========================================
    // Packet MAC
    // ===========================================

    #[test]
    fn mac_verifies() {
        let keys = SessionKeys::derive(&test_secret(), 0);
        let nonce = [7u8; NONCE_SIZE];
        let mac = packet_mac(keys.authentication_key(), b"ctx", &nonce, b"ciphertext");

        verify_packet_mac(keys.authentication_key(), b"ctx", &nonce, b"ciphertext", &mac).unwrap();
    }

    #[test]
    fn tampered_mac_fails() {
        let keys = SessionKeys::derive(&test_secret(), 0);
        let nonce = [7u8; NONCE_SIZE];
        let mut mac = packet_mac(keys.authentication_key(), b"ctx", &nonce, b"ciphertext");
        mac[0] ^= 0x01;

        let result =
            verify_packet_mac(keys.authentication_key(), b"ctx", &nonce, b"ciphertext", &mac);
        assert!(matches!(result, Err(CryptoError::MacMismatch)));
    }

    #[test]
    fn tampered_ciphertext_fails_mac() {
        let keys = SessionKeys::derive(&test_secret(), 0);
        let nonce = [7u8; NONCE_SIZE];
        let mac = packet_mac(keys.authentication_key(), b"ctx", &nonce, b"ciphertext");

        let result =
            verify_packet_mac(keys.authentication_key(), b"ctx", &nonce, b"tampertext", &mac);
        assert!(matches!(result, Err(CryptoError::MacMismatch)));
    }

    #[test]
    fn mac_binds_context() {
        let keys = SessionKeys::derive(&test_secret(), 0);
        let nonce = [7u8; NONCE_SIZE];
        let mac = packet_mac(keys.authentication_key(), b"session-a", &nonce, b"ct");

        let result =
            verify_packet_mac(keys.authentication_key(), b"session-b", &nonce, b"ct", &mac);
        assert!(matches!(result, Err(CryptoError::MacMismatch)));
    }

    #[test]
    fn session_tag_is_deterministic_per_secret() {
        let a = derive_session_tag(&test_secret());
        let b = derive_session_tag(&test_secret());
        assert_eq!(a, b);

        let other = derive_session_tag(&SessionSecret::from_bytes([0x43; 32]));
        assert_ne!(a, other);
    }

    // ===========================================
    // Hygiene
    // ===========================================

    #[test]
    fn debug_output_is_redacted() {
        let identity = IdentityKeyPair::generate();
        let keys = SessionKeys::derive(&test_secret(), 0);
        let secret = test_secret();

        for debug in [
            format!("{:?}", identity),
            format!("{:?}", keys),
            format!("{:?}", secret),
        ] {
            assert!(debug.contains("REDACTED"), "got: {}", debug);
        }
    }

    #[test]
    fn zeroize_wipes_session_keys() {
        let mut keys = SessionKeys::derive(&test_secret(), 0);
        assert!(!keys.is_zeroized());
        keys.zeroize();
        assert!(keys.is_zeroized());
    }
}
