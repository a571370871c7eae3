//! In-memory transport for testing.
//!
//! [`MemoryTransport::linked_pair`] wires two endpoints together so two
//! orchestrators can run a whole protocol exchange in-process. Sent frames
//! are also captured for verification, and failures can be injected.

use super::{DeviceTransport, TransportError};
use sync_types::DeviceId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

struct PeerLink {
    tx: UnboundedSender<(DeviceId, Vec<u8>)>,
    connected: AtomicBool,
}

/// In-memory transport endpoint for one device.
pub struct MemoryTransport {
    local: DeviceId,
    links: DashMap<DeviceId, PeerLink>,
    inbox: tokio::sync::Mutex<UnboundedReceiver<(DeviceId, Vec<u8>)>>,
    inbox_tx: UnboundedSender<(DeviceId, Vec<u8>)>,
    sent: Mutex<Vec<(DeviceId, Vec<u8>)>>,
    fail_next_send: Mutex<Option<String>>,
}

impl MemoryTransport {
    /// Create an endpoint with no peers linked yet.
    pub fn new(local: DeviceId) -> Self {
        let (inbox_tx, inbox_rx) = unbounded_channel();
        Self {
            local,
            links: DashMap::new(),
            inbox: tokio::sync::Mutex::new(inbox_rx),
            inbox_tx,
            sent: Mutex::new(Vec::new()),
            fail_next_send: Mutex::new(None),
        }
    }

    /// Create two endpoints wired to each other.
    pub fn linked_pair(
        a: DeviceId,
        b: DeviceId,
    ) -> (Arc<Self>, Arc<Self>) {
        let left = Arc::new(Self::new(a));
        let right = Arc::new(Self::new(b));
        Self::link(&left, &right);
        (left, right)
    }

    /// Wire two existing endpoints together.
    pub fn link(left: &Arc<Self>, right: &Arc<Self>) {
        left.links.insert(
            right.local,
            PeerLink {
                tx: right.inbox_tx.clone(),
                connected: AtomicBool::new(true),
            },
        );
        right.links.insert(
            left.local,
            PeerLink {
                tx: left.inbox_tx.clone(),
                connected: AtomicBool::new(true),
            },
        );
    }

    /// All frames sent so far, with their destination.
    pub fn sent_frames(&self) -> Vec<(DeviceId, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    /// The most recent frame sent, if any.
    pub fn last_sent(&self) -> Option<(DeviceId, Vec<u8>)> {
        self.sent.lock().unwrap().last().cloned()
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        *self.fail_next_send.lock().unwrap() = Some(error.to_string());
    }
}

#[async_trait]
impl DeviceTransport for MemoryTransport {
    async fn send(&self, peer: DeviceId, frame: &[u8]) -> Result<(), TransportError> {
        let link = self.links.get(&peer).ok_or(TransportError::NotConnected)?;
        if !link.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }

        if let Some(error) = self.fail_next_send.lock().unwrap().take() {
            return Err(TransportError::SendFailed(error));
        }

        self.sent.lock().unwrap().push((peer, frame.to_vec()));
        link.tx
            .send((self.local, frame.to_vec()))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<(DeviceId, Vec<u8>), TransportError> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::ConnectionClosed)
    }

    fn is_connected(&self, peer: DeviceId) -> bool {
        self.links
            .get(&peer)
            .map(|link| link.connected.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    async fn close(&self, peer: DeviceId) -> Result<(), TransportError> {
        if let Some(link) = self.links.get(&peer) {
            link.connected.store(false, Ordering::SeqCst);
        }
        Ok(())
    }
}
