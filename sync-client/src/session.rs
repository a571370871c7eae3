//! Session management: ephemeral key exchange, packet encryption, key
//! rotation, zeroized teardown.
//!
//! Every session between a device pair runs on keys derived from a fresh
//! ephemeral x25519 exchange. The long-term identity keys verified during
//! pairing never encrypt traffic, so compromising them (or one session's
//! keys) exposes no other session's traffic.
//!
//! The active-session table supports concurrent sessions with distinct
//! peers; one attempt per peer at a time is the orchestrator's job.

use dashmap::DashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use zeroize::Zeroize;

use sync_types::{
    DeviceId, DevicePublicKey, EncryptedSyncPacket, ExchangeId, KeyExchangeAnswer,
    KeyExchangeOffer, SessionId, SyncMessage, WireError,
};

use crate::crypto::{
    aead_decrypt, aead_encrypt, derive_session_tag, packet_mac, verify_packet_mac, CryptoError,
    EphemeralExchange, SessionKeys, SessionSecret,
};

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No active session with the given id.
    #[error("no active session: {0}")]
    UnknownSession(SessionId),

    /// Packet HMAC (or AEAD tag) did not verify.
    #[error("packet authentication failed")]
    AuthenticationFailed,

    /// The key exchange could not be completed.
    #[error("key exchange failed: {0}")]
    KeyExchangeFailure(String),

    /// Inner message could not be encoded or decoded.
    #[error("message encoding failed: {0}")]
    Encoding(#[from] WireError),
}

impl From<CryptoError> for SessionError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::MacMismatch | CryptoError::DecryptionFailed => Self::AuthenticationFailed,
            other => Self::KeyExchangeFailure(other.to_string()),
        }
    }
}

/// A live forward-secret session with one peer.
pub struct SyncSession {
    session_id: SessionId,
    /// The peer device.
    peer: DeviceId,
    /// The peer's verified long-term identity key (trust anchor from pairing).
    peer_identity: DevicePublicKey,
    /// Our ephemeral public key for this session.
    ephemeral_public_key: [u8; 32],
    /// Retained for the ratchet; wiped on close.
    secret: SessionSecret,
    keys: SessionKeys,
    created_at: u64,
    rotation_count: u32,
}

impl SyncSession {
    /// The session identifier.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// The peer device.
    pub fn peer(&self) -> DeviceId {
        self.peer
    }

    /// The peer's long-term identity key.
    pub fn peer_identity(&self) -> DevicePublicKey {
        self.peer_identity
    }

    /// Our ephemeral public key for this session.
    pub fn ephemeral_public_key(&self) -> [u8; 32] {
        self.ephemeral_public_key
    }

    /// When the session was established (Unix millis).
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// How many times the keys have been rotated.
    pub fn rotation_count(&self) -> u32 {
        self.rotation_count
    }

    /// Overwrite all key material with zeros. Irreversible.
    fn wipe(&mut self) {
        self.keys.zeroize();
        self.secret.zeroize();
    }
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("session_id", &self.session_id)
            .field("peer", &self.peer)
            .field("rotation_count", &self.rotation_count)
            .field("keys", &"[REDACTED]")
            .finish()
    }
}

/// A half-open key exchange awaiting the peer's answer.
struct PendingExchange {
    peer: DeviceId,
    peer_identity: DevicePublicKey,
    exchange: EphemeralExchange,
}

/// Manages the active-session table for the local device.
pub struct SessionManager {
    local_device: DeviceId,
    sessions: DashMap<SessionId, SyncSession>,
    pending: DashMap<ExchangeId, PendingExchange>,
}

impl SessionManager {
    /// Create a manager for the local device.
    pub fn new(local_device: DeviceId) -> Self {
        Self {
            local_device,
            sessions: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    /// Begin a key exchange with a peer (initiator side).
    ///
    /// Generates a fresh ephemeral key pair and returns the offer to send.
    /// The half-open exchange is held until [`complete_key_exchange`] or
    /// [`cancel_exchange`].
    ///
    /// [`complete_key_exchange`]: Self::complete_key_exchange
    /// [`cancel_exchange`]: Self::cancel_exchange
    pub fn initiate_key_exchange(
        &self,
        peer: DeviceId,
        peer_identity: DevicePublicKey,
    ) -> KeyExchangeOffer {
        let exchange = EphemeralExchange::generate();
        let offer = KeyExchangeOffer {
            exchange_id: ExchangeId::random(),
            device_id: self.local_device,
            ephemeral_public_key: exchange.public_bytes(),
        };

        self.pending.insert(
            offer.exchange_id,
            PendingExchange {
                peer,
                peer_identity,
                exchange,
            },
        );

        tracing::debug!("initiated key exchange {} with {}", offer.exchange_id, peer);
        offer
    }

    /// Accept a peer's key exchange offer (responder side).
    ///
    /// Generates our own fresh ephemeral key pair, derives the session,
    /// and returns the answer to send back.
    pub fn accept_sync_session(
        &self,
        peer: DeviceId,
        peer_identity: DevicePublicKey,
        offer: &KeyExchangeOffer,
    ) -> Result<(SessionId, KeyExchangeAnswer), SessionError> {
        let exchange = EphemeralExchange::generate();
        let our_public = exchange.public_bytes();
        let secret = exchange.agree(&offer.ephemeral_public_key);

        let session_id = self.install_session(peer, peer_identity, our_public, secret);

        let answer = KeyExchangeAnswer {
            exchange_id: offer.exchange_id,
            device_id: self.local_device,
            ephemeral_public_key: our_public,
        };

        Ok((session_id, answer))
    }

    /// Complete an initiated exchange with the peer's answer.
    pub fn complete_key_exchange(
        &self,
        answer: &KeyExchangeAnswer,
    ) -> Result<SessionId, SessionError> {
        let (_, pending) = self.pending.remove(&answer.exchange_id).ok_or_else(|| {
            SessionError::KeyExchangeFailure(format!("unknown exchange {}", answer.exchange_id))
        })?;

        if pending.peer != answer.device_id {
            return Err(SessionError::KeyExchangeFailure(format!(
                "answer from {} for an exchange with {}",
                answer.device_id, pending.peer
            )));
        }

        let our_public = pending.exchange.public_bytes();
        let secret = pending.exchange.agree(&answer.ephemeral_public_key);

        Ok(self.install_session(pending.peer, pending.peer_identity, our_public, secret))
    }

    /// Discard a half-open exchange; its ephemeral secret is wiped on drop.
    pub fn cancel_exchange(&self, exchange_id: ExchangeId) {
        if self.pending.remove(&exchange_id).is_some() {
            tracing::debug!("cancelled key exchange {}", exchange_id);
        }
    }

    /// Discard every half-open exchange (attempt aborted).
    pub fn cancel_all_exchanges(&self) {
        self.pending.clear();
    }

    fn install_session(
        &self,
        peer: DeviceId,
        peer_identity: DevicePublicKey,
        ephemeral_public_key: [u8; 32],
        secret: SessionSecret,
    ) -> SessionId {
        // Both ends derive the same id from the shared secret, so packets
        // address the session without a negotiation round.
        let session_id = SessionId::from_bytes(derive_session_tag(&secret));
        let keys = SessionKeys::derive(&secret, 0);

        self.sessions.insert(
            session_id,
            SyncSession {
                session_id,
                peer,
                peer_identity,
                ephemeral_public_key,
                secret,
                keys,
                created_at: now_millis(),
                rotation_count: 0,
            },
        );

        tracing::info!("session {} established with {}", session_id, peer);
        session_id
    }

    /// Encrypt an inner message for a session.
    ///
    /// Encrypt-then-MAC: AEAD under the encryption key, then HMAC-SHA256
    /// over (session id ‖ nonce ‖ ciphertext) under the authentication key.
    pub fn encrypt_sync_data(
        &self,
        session_id: SessionId,
        message: &SyncMessage,
    ) -> Result<EncryptedSyncPacket, SessionError> {
        let session = self
            .sessions
            .get(&session_id)
            .ok_or(SessionError::UnknownSession(session_id))?;

        let plaintext = message.to_bytes()?;
        let (ciphertext, nonce) = aead_encrypt(session.keys.encryption_key(), &plaintext)?;
        let hmac = packet_mac(
            session.keys.authentication_key(),
            session_id.as_uuid().as_bytes(),
            &nonce,
            &ciphertext,
        );

        Ok(EncryptedSyncPacket {
            session_id,
            device_id: self.local_device,
            nonce,
            ciphertext,
            hmac,
            timestamp: now_millis(),
        })
    }

    /// Decrypt a received packet.
    ///
    /// The HMAC is verified (in constant time) *before* any decryption is
    /// attempted; a mismatch never reaches the cipher.
    pub fn decrypt_sync_data(
        &self,
        packet: &EncryptedSyncPacket,
    ) -> Result<SyncMessage, SessionError> {
        let session = self
            .sessions
            .get(&packet.session_id)
            .ok_or(SessionError::UnknownSession(packet.session_id))?;

        verify_packet_mac(
            session.keys.authentication_key(),
            packet.session_id.as_uuid().as_bytes(),
            &packet.nonce,
            &packet.ciphertext,
            &packet.hmac,
        )?;

        let plaintext = aead_decrypt(
            session.keys.encryption_key(),
            &packet.ciphertext,
            &packet.nonce,
        )?;

        Ok(SyncMessage::from_bytes(&plaintext)?)
    }

    /// Ratchet a session's keys forward one epoch.
    ///
    /// New keys derive from the retained shared secret and the incremented
    /// rotation counter; the old keys are wiped. Both peers must rotate in
    /// lockstep for traffic to keep flowing.
    pub fn rotate_session_keys(&self, session_id: SessionId) -> Result<u32, SessionError> {
        let mut session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(SessionError::UnknownSession(session_id))?;

        session.rotation_count += 1;
        let next = SessionKeys::derive(&session.secret, session.rotation_count);
        session.keys.zeroize();
        session.keys = next;

        tracing::debug!(
            "session {} rotated to epoch {}",
            session_id,
            session.rotation_count
        );
        Ok(session.rotation_count)
    }

    /// Close a session: wipe its key material, then drop it.
    ///
    /// Irreversible. Any later encrypt/decrypt against this id fails with
    /// [`SessionError::UnknownSession`].
    pub fn close_sync_session(&self, session_id: SessionId) -> Result<(), SessionError> {
        let (_, mut session) = self
            .sessions
            .remove(&session_id)
            .ok_or(SessionError::UnknownSession(session_id))?;

        session.wipe();
        tracing::info!("session {} closed", session_id);
        Ok(())
    }

    /// The live session id with a peer, if any.
    pub fn session_for_peer(&self, peer: DeviceId) -> Option<SessionId> {
        self.sessions
            .iter()
            .find(|entry| entry.peer == peer)
            .map(|entry| entry.session_id)
    }

    /// Metadata of a session (peer, creation time, rotation count).
    pub fn session_info(&self, session_id: SessionId) -> Option<(DeviceId, u64, u32)> {
        self.sessions
            .get(&session_id)
            .map(|s| (s.peer, s.created_at, s.rotation_count))
    }

    /// Number of active sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("local_device", &self.local_device)
            .field("sessions", &self.sessions.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
