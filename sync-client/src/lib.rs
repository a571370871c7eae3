//! # sync-client
//!
//! Client library for the VaultMesh vault sync protocol.
//!
//! This is the library that applications embed to sync an encrypted
//! credential vault across nearby trusted devices.
//!
//! ## Features
//!
//! - **QR-bootstrapped pairing**: challenge-response over an out-of-band
//!   invitation, no server involved
//! - **Forward secrecy**: fresh x25519 ephemeral keys per session,
//!   HKDF-separated encryption/authentication subkeys, ratchet rotation
//! - **Encrypt-then-MAC**: XChaCha20-Poly1305 with 192-bit nonces, packet
//!   HMAC verified before any decryption
//! - **Manifest reconciliation**: minimal entry exchange with explicit
//!   conflict detection and deterministic resolution
//! - **Pure core**: protocol logic lives in `sync-core` state machines;
//!   this crate interprets their actions and performs the I/O
//!
//! ## Example
//!
//! ```ignore
//! use vaultmesh_client::{MemoryVaultStore, SyncConfig, SyncOrchestrator};
//!
//! let orchestrator =
//!     SyncOrchestrator::open(config, device_id, transport, store, vault_id, discovery).await?;
//! let invitation = orchestrator.create_invitation("192.168.1.20", 48700);
//! // display invitation.to_qr_string() ... peer scans and answers ...
//! let peer = orchestrator.await_pairing().await?;
//! let report = orchestrator.run_sync(peer).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod crypto;
pub mod discovery;
pub mod engine;
pub mod session;
pub mod syncer;
pub mod transport;
pub mod vault;

pub use config::SyncConfig;
pub use crypto::{CryptoError, IdentityKeyPair, SessionKeys, SessionSecret, KEY_SIZE, NONCE_SIZE};
pub use discovery::{DiscoveredPeer, DiscoveryService, StaticDiscovery};
pub use engine::ManifestEngine;
pub use session::{SessionError, SessionManager, SyncSession};
pub use syncer::{PeerStatus, SyncError, SyncOrchestrator, SyncReport};
pub use transport::{DeviceTransport, MemoryTransport, TransportError};
pub use vault::{MemoryVaultStore, VaultError, VaultRecord, VaultStore};
