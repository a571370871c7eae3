//! Transport abstraction for VaultMesh.
//!
//! This module provides a pluggable transport layer that abstracts the
//! underlying channel between paired devices (LAN sockets in production,
//! in-memory pipes for testing).
//!
//! # Design
//!
//! The transport is a framed per-peer channel:
//! - `send()` transmits one frame's bytes to a named peer
//! - `recv()` receives the next frame, tagged with its sender
//! - `close()` tears down the channel to one peer
//!
//! Frames are opaque bytes here; the encrypted envelope format lives in
//! `sync-types`. The engine never opens sockets itself.

mod mock;

pub use mock::MemoryTransport;

use async_trait::async_trait;
use thiserror::Error;

use sync_types::DeviceId;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection to the peer failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// No open channel to the peer.
    #[error("not connected")]
    NotConnected,

    /// The channel was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// The operation timed out.
    #[error("transport timeout")]
    Timeout,
}

/// Framed per-peer message channel.
///
/// Implementations handle the underlying connection mechanism; the sync
/// engine only sends and receives whole frames.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Send one frame to a peer.
    async fn send(&self, peer: DeviceId, frame: &[u8]) -> Result<(), TransportError>;

    /// Receive the next frame from any peer, tagged with its sender.
    ///
    /// Blocks until a frame is available or every channel closes.
    async fn recv(&self) -> Result<(DeviceId, Vec<u8>), TransportError>;

    /// Whether a channel to the peer is open.
    fn is_connected(&self, peer: DeviceId) -> bool;

    /// Close the channel to a peer.
    async fn close(&self, peer: DeviceId) -> Result<(), TransportError>;
}
