//! # sync-types
//!
//! Wire format and identity types for the VaultMesh vault sync protocol.
//!
//! This crate provides the foundational types used across all VaultMesh crates:
//! - [`DeviceId`], [`VaultId`], [`EntryId`], [`SessionId`], [`ExchangeId`] - Identity types
//! - [`DeviceIdentity`] - A device's long-term public identity
//! - [`PairingInvitation`], [`PairingResponse`] - Out-of-band pairing payloads
//! - [`SyncManifest`], [`SyncEntry`] - Per-device vault snapshots
//! - [`EncryptedSyncPacket`] - The encrypted wire unit
//! - [`Frame`], [`SyncMessage`] - Outer framing and inner protocol messages
//! - [`WireError`] - Serialization error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod frame;
mod identity;
mod ids;
mod manifest;
mod messages;
mod packet;
mod pairing;

pub use error::WireError;
pub use frame::{Frame, FramePayload, WIRE_VERSION};
pub use identity::{Capabilities, DeviceIdentity, DevicePublicKey};
pub use ids::{DeviceId, EntryId, ExchangeId, SessionId, VaultId};
pub use manifest::{EntryAction, SyncEntry, SyncManifest, MANIFEST_SCHEMA_VERSION};
pub use messages::{KeyExchangeAnswer, KeyExchangeOffer, SyncMessage};
pub use packet::EncryptedSyncPacket;
pub use pairing::{PairingInvitation, PairingResponse, PAIRING_SCHEMA_VERSION};
