//! The sync orchestrator - drives pairing, sessions and reconciliation.
//!
//! Protocol decisions live in the pure `sync-core` state machine; this
//! module interprets its actions and performs the I/O: transport frames,
//! session crypto, vault reads and writes. One orchestrator instance
//! serves one device and supports concurrent attempts with distinct
//! peers; attempts with the same peer are serialized by a per-peer guard,
//! and vault writes from all attempts funnel through a single-writer lock.
//!
//! A sync round is symmetric: each side snapshots its vault into a
//! manifest, diffs it against the peer's, resolves conflicts with the
//! same deterministic rules, sends the entries the peer lacks (plus the
//! conflict winners it owns), and applies what arrives until the peer's
//! commit acknowledgement. Both vaults converge without either side
//! coordinating beyond the ordered frame stream.

use dashmap::DashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;

use sync_core::conflict::{
    resolve, resolution_options_for, ConflictError, ConflictResolution, ResolvedConflict,
    SyncConflict,
};
use sync_core::diff::{diff, validate_manifest, ManifestDiff, ManifestError};
use sync_core::orchestrator::{Action, Event, StatusEvent, SyncState};
use sync_core::pairing::{
    accept_invitation, create_invitation, decode_scanned_invitation, verify_response, PairingError,
};
use sync_core::{TombstoneTracker, VersionTracker};
use sync_types::{
    DeviceId, DeviceIdentity, DevicePublicKey, Frame, FramePayload, PairingInvitation, SessionId,
    SyncManifest, SyncMessage, VaultId, WireError,
};

use crate::config::SyncConfig;
use crate::crypto::IdentityKeyPair;
use crate::discovery::{DiscoveredPeer, DiscoveryService};
use crate::engine::{hash_payload, ManifestEngine};
use crate::session::{SessionError, SessionManager};
use crate::transport::{DeviceTransport, TransportError};
use crate::vault::{VaultError, VaultStore};

/// Top-level sync errors surfaced to the embedding application.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Pairing failed.
    #[error("pairing failed: {0}")]
    Pairing(#[from] PairingError),

    /// Session layer failed.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Manifest was rejected.
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Conflict resolution was rejected.
    #[error("conflict error: {0}")]
    Conflict(#[from] ConflictError),

    /// Transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Vault storage failed.
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    /// Wire encoding failed.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// The manifest exchange stalled past its deadline.
    #[error("sync timed out")]
    Timeout,

    /// Another attempt with this peer is still running.
    #[error("sync attempt already in progress with {0}")]
    AttemptInProgress(DeviceId),

    /// No live session with the peer.
    #[error("no session with {0}")]
    NoSession(DeviceId),

    /// No invitation is outstanding.
    #[error("no outstanding invitation")]
    NoInvitation,

    /// The peer violated the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// A status event, tagged with the peer it concerns.
#[derive(Debug, Clone)]
pub struct PeerStatus {
    /// The peer the event concerns (absent for purely local events).
    pub peer: Option<DeviceId>,
    /// What happened.
    pub event: StatusEvent,
}

/// The outcome of one completed sync round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// The peer the round ran against.
    pub peer: DeviceId,
    /// Entries shipped to the peer.
    pub entries_sent: usize,
    /// Entries received and applied.
    pub entries_received: usize,
    /// Conflicts resolved during the round.
    pub conflicts_resolved: usize,
    /// Wall-clock duration of the round.
    pub duration: Duration,
}

/// Drives pairing and sync for one device.
pub struct SyncOrchestrator<T: DeviceTransport, S: VaultStore> {
    config: SyncConfig,
    identity: DeviceIdentity,
    sessions: SessionManager,
    transport: Arc<T>,
    engine: ManifestEngine<S>,
    discovery: Arc<dyn DiscoveryService>,
    /// Trust anchors established by pairing: peer id → identity key.
    trusted_peers: DashMap<DeviceId, DevicePublicKey>,
    /// Per-peer in-flight attempt guard.
    attempts: DashMap<DeviceId, ()>,
    /// Rounds completed since the last key rotation, per peer.
    rounds_since_rotation: DashMap<DeviceId, u32>,
    /// Last completed activity per peer, for keep-warm retirement.
    last_activity: DashMap<DeviceId, Instant>,
    /// The single outstanding invitation (single-use).
    invitation: StdMutex<Option<PairingInvitation>>,
    versions: StdMutex<VersionTracker>,
    tombstones: StdMutex<TombstoneTracker>,
    /// Single-writer discipline for vault mutations across all attempts.
    vault_write_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<PeerStatus>,
    // Long-term identity secret; kept for future re-pairing proofs.
    _identity_keys: IdentityKeyPair,
}

impl<T: DeviceTransport, S: VaultStore> SyncOrchestrator<T, S> {
    /// Create an orchestrator for one device and one vault.
    ///
    /// Generates the device's identity key pair and seeds the manifest
    /// version counter from the store. The device id is the installation's
    /// stable identifier, created once and passed in on every start.
    pub async fn open(
        config: SyncConfig,
        device_id: DeviceId,
        transport: Arc<T>,
        store: Arc<S>,
        vault_id: VaultId,
        discovery: Arc<dyn DiscoveryService>,
    ) -> Result<Self, SyncError> {
        let identity_keys = IdentityKeyPair::generate();
        let identity = DeviceIdentity::new(device_id, identity_keys.public_key())
            .with_capability("protocol", "1")
            .with_capability("cipher", "xchacha20poly1305")
            .with_capability("vault_format", "1");

        let engine = ManifestEngine::open(store, vault_id, device_id).await?;
        let (events, _) = broadcast::channel(64);

        Ok(Self {
            config,
            identity,
            sessions: SessionManager::new(device_id),
            transport,
            engine,
            discovery,
            trusted_peers: DashMap::new(),
            attempts: DashMap::new(),
            rounds_since_rotation: DashMap::new(),
            last_activity: DashMap::new(),
            invitation: StdMutex::new(None),
            versions: StdMutex::new(VersionTracker::new()),
            tombstones: StdMutex::new(TombstoneTracker::new()),
            vault_write_lock: tokio::sync::Mutex::new(()),
            events,
            _identity_keys: identity_keys,
        })
    }

    /// This device's id.
    pub fn device_id(&self) -> DeviceId {
        self.identity.device_id
    }

    /// This device's public identity.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Subscribe to status events. Events for one peer arrive in order.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerStatus> {
        self.events.subscribe()
    }

    /// Peers currently visible on the discovery feed.
    pub async fn discovered_peers(&self) -> Vec<DiscoveredPeer> {
        self.discovery.peers().await
    }

    /// Whether a live session exists with the peer.
    pub fn has_session(&self, peer: DeviceId) -> bool {
        self.sessions.session_for_peer(peer).is_some()
    }

    /// The rotation epoch of the live session with a peer, if any.
    pub fn session_rotation(&self, peer: DeviceId) -> Option<u32> {
        let session_id = self.sessions.session_for_peer(peer)?;
        self.sessions.session_info(session_id).map(|(_, _, count)| count)
    }

    // ===========================================
    // Pairing
    // ===========================================

    /// Create a single-use pairing invitation to display as a QR code.
    ///
    /// Replaces any previously outstanding invitation.
    pub fn create_invitation(&self, address: &str, port: u16) -> PairingInvitation {
        let mut state = SyncState::new();
        state = self.advance(None, state, Event::InvitationRequested).0;

        let invitation = create_invitation(
            &self.identity,
            &self.config.device_name,
            address,
            port,
            self.config.invitation_ttl,
        );
        *self.invitation.lock().unwrap() = Some(invitation.clone());

        self.advance(None, state, Event::InvitationReady);
        invitation
    }

    /// Wait for a peer to answer the outstanding invitation, verify it,
    /// and establish a session (inviter side).
    ///
    /// The invitation is invalidated as soon as one response is accepted -
    /// or on any failure - so it can never be answered twice.
    pub async fn await_pairing(&self) -> Result<DeviceId, SyncError> {
        let invitation = self
            .invitation
            .lock()
            .unwrap()
            .clone()
            .ok_or(SyncError::NoInvitation)?;

        let mut state = SyncState::Pairing(sync_core::PairingPhase::WaitingForScan);

        let remaining = Duration::from_millis(
            invitation
                .expires_at
                .saturating_sub(sync_core::pairing::now_millis()),
        );

        let response = match tokio::time::timeout(remaining, self.recv_pairing_response()).await {
            Ok(result) => result?,
            Err(_) => {
                self.invitation.lock().unwrap().take();
                self.advance(None, state, Event::InvitationExpired);
                return Err(PairingError::Expired.into());
            }
        };

        let peer = response.device_id;
        state = self.advance(Some(peer), state, Event::PeerConnected).0;

        if let Err(e) = verify_response(&invitation, &response) {
            self.invitation.lock().unwrap().take();
            let event = match e {
                PairingError::Expired => Event::InvitationExpired,
                ref other => Event::VerificationFailed {
                    reason: other.to_string(),
                },
            };
            // Walk to Verifying so the failure lands in the right state
            let (state, _) = state.on_event(Event::KeysExchanged);
            self.advance(Some(peer), state, event);
            return Err(e.into());
        }

        // Single use: gone before any session work happens
        self.invitation.lock().unwrap().take();
        self.trusted_peers.insert(peer, response.public_key);

        // Ephemeral key exchange, initiator side
        let offer = self.sessions.initiate_key_exchange(peer, response.public_key);
        let exchange_id = offer.exchange_id;
        self.send_frame(peer, FramePayload::KeyExchangeOffer(offer))
            .await?;

        let answer = match self.recv_frame_from(peer).await {
            Ok(Frame {
                payload: FramePayload::KeyExchangeAnswer(answer),
                ..
            }) => answer,
            Ok(_) => {
                self.sessions.cancel_exchange(exchange_id);
                return Err(SyncError::Protocol("expected key exchange answer".into()));
            }
            Err(e) => {
                self.sessions.cancel_exchange(exchange_id);
                self.advance(
                    Some(peer),
                    state,
                    Event::TransportFailed {
                        error: e.to_string(),
                    },
                );
                return Err(e);
            }
        };

        self.sessions.complete_key_exchange(&answer)?;
        self.tombstones.lock().unwrap().device_paired(peer);
        self.last_activity.insert(peer, Instant::now());

        let (state, _) = state.on_event(Event::KeysExchanged);
        self.advance(Some(peer), state, Event::SessionAccepted);

        tracing::info!("paired with {} (inviter side)", peer);
        Ok(peer)
    }

    /// Answer a scanned invitation and establish a session (scanner side).
    pub async fn pair_with_invitation(&self, qr_payload: &str) -> Result<DeviceId, SyncError> {
        let mut state = SyncState::new();
        state = self.advance(None, state, Event::ScanStarted).0;

        let invitation = decode_scanned_invitation(qr_payload)?;
        let peer = invitation.device_id;
        state = self.advance(Some(peer), state, Event::InvitationScanned).0;

        if !self.transport.is_connected(peer) {
            let error = format!("no transport channel to {}", invitation.address);
            self.advance(
                Some(peer),
                state,
                Event::TransportFailed {
                    error: error.clone(),
                },
            );
            return Err(SyncError::Transport(TransportError::ConnectionFailed(error)));
        }
        state = self.advance(Some(peer), state, Event::PeerConnected).0;

        let response = match accept_invitation(&invitation, &self.identity) {
            Ok(response) => response,
            Err(e) => {
                self.advance(Some(peer), state, Event::InvitationExpired);
                return Err(e.into());
            }
        };

        self.send_frame(peer, FramePayload::PairingResponse(response))
            .await?;
        self.trusted_peers.insert(peer, invitation.public_key);

        // The inviter verifies our response, then opens the key exchange
        let offer = match self.recv_frame_from(peer).await? {
            Frame {
                payload: FramePayload::KeyExchangeOffer(offer),
                ..
            } => offer,
            _ => return Err(SyncError::Protocol("expected key exchange offer".into())),
        };

        let (_session_id, answer) =
            self.sessions
                .accept_sync_session(peer, invitation.public_key, &offer)?;
        self.send_frame(peer, FramePayload::KeyExchangeAnswer(answer))
            .await?;

        self.tombstones.lock().unwrap().device_paired(peer);
        self.last_activity.insert(peer, Instant::now());

        let (state, _) = state.on_event(Event::KeysExchanged);
        self.advance(Some(peer), state, Event::SessionAccepted);

        tracing::info!("paired with {} (scanner side)", peer);
        Ok(peer)
    }

    /// Abort any in-flight pairing: discard the outstanding invitation and
    /// zeroize half-open key exchanges. Safe to call at any time; no
    /// partial session survives.
    pub fn cancel_pairing(&self) {
        self.invitation.lock().unwrap().take();
        self.sessions.cancel_all_exchanges();
        self.emit(None, StatusEvent::SyncCancelled);
    }

    // ===========================================
    // Sync rounds
    // ===========================================

    /// Run one sync round against a paired peer (initiator side).
    ///
    /// Serializes with other attempts against the same peer; attempts with
    /// distinct peers run independently. Manifest exchange is retried up
    /// to the configured bound with backoff, and the whole round is
    /// subject to the configured timeout.
    pub async fn run_sync(&self, peer: DeviceId) -> Result<SyncReport, SyncError> {
        let _guard = AttemptGuard::acquire(&self.attempts, peer)?;
        let session_id = self
            .sessions
            .session_for_peer(peer)
            .ok_or(SyncError::NoSession(peer))?;

        let started = Instant::now();
        let mut state = SyncState::SessionEstablished;
        state = self.advance(Some(peer), state, Event::SyncRequested).0;

        loop {
            let round = tokio::time::timeout(
                self.config.manifest_timeout,
                self.initiator_round(peer, session_id),
            )
            .await;

            match round {
                Err(_) => {
                    self.advance(Some(peer), state, Event::ExchangeTimedOut);
                    return Err(SyncError::Timeout);
                }
                Ok(Ok(outcome)) => {
                    state = self
                        .advance(
                            Some(peer),
                            state,
                            Event::DiffComputed {
                                conflicts: outcome.conflicts_resolved,
                            },
                        )
                        .0;
                    if outcome.conflicts_resolved > 0 {
                        state = self.advance(Some(peer), state, Event::ConflictsResolved).0;
                    }

                    self.finish_round(peer, session_id, &outcome).await?;
                    self.advance(Some(peer), state, Event::CommitCompleted);

                    return Ok(SyncReport {
                        peer,
                        entries_sent: outcome.entries_sent,
                        entries_received: outcome.entries_received,
                        conflicts_resolved: outcome.conflicts_resolved,
                        duration: started.elapsed(),
                    });
                }
                Ok(Err(SyncError::Transport(e))) => {
                    let (next, actions) = self.advance(
                        Some(peer),
                        state,
                        Event::TransportFailed {
                            error: e.to_string(),
                        },
                    );
                    state = next;

                    let delay = actions.iter().find_map(|a| match a {
                        Action::StartRetryTimer { delay } => Some(*delay),
                        _ => None,
                    });
                    match delay {
                        Some(delay) => {
                            tracing::warn!(
                                "manifest exchange with {} failed ({}), retrying in {:?}",
                                peer,
                                e,
                                delay
                            );
                            tokio::time::sleep(delay).await;
                            state = self.advance(Some(peer), state, Event::RetryTimerFired).0;
                        }
                        None => return Err(SyncError::Transport(e)),
                    }
                }
                Ok(Err(other)) => {
                    self.emit(
                        Some(peer),
                        StatusEvent::SyncFailed {
                            reason: other.to_string(),
                        },
                    );
                    return Err(other);
                }
            }
        }
    }

    /// One initiator-side exchange: send our manifest, receive theirs,
    /// diff, resolve, transfer, and apply until the peer's commit ack.
    async fn initiator_round(
        &self,
        peer: DeviceId,
        session_id: SessionId,
    ) -> Result<RoundOutcome, SyncError> {
        let local = self.engine.build_manifest().await?;
        self.send_message(peer, session_id, &SyncMessage::Manifest(local.clone()))
            .await?;

        let remote = match self.recv_message_from(peer).await? {
            SyncMessage::Manifest(manifest) => manifest,
            other => {
                return Err(SyncError::Protocol(format!(
                    "expected manifest, got {:?}",
                    message_kind(&other)
                )))
            }
        };
        self.accept_manifest(&remote)?;

        let result = diff(&local, &remote);
        tracing::debug!(
            "diff with {}: {} to send, {} to receive, {} conflicts",
            peer,
            result.to_send.len(),
            result.to_receive.len(),
            result.conflicts.len()
        );

        let resolved = self.resolve_batch(&result)?;
        let entries_sent = self
            .send_transfers(peer, session_id, &local, &result, &resolved)
            .await?;
        self.send_message(
            peer,
            session_id,
            &SyncMessage::CommitAck {
                version: local.version,
            },
        )
        .await?;

        let entries_received = self.apply_until_ack(peer).await?;

        Ok(RoundOutcome {
            remote_device: remote.device_id,
            remote_version: remote.version,
            local_manifest: local,
            entries_sent,
            entries_received,
            conflicts_resolved: result.conflicts.len(),
        })
    }

    /// Commit bookkeeping shared by both sides of a round.
    async fn finish_round(
        &self,
        peer: DeviceId,
        session_id: SessionId,
        outcome: &RoundOutcome,
    ) -> Result<(), SyncError> {
        {
            let mut versions = self.versions.lock().unwrap();
            versions.record(outcome.remote_device, outcome.remote_version);
        }
        let committed = self.engine.commit_version();

        {
            let mut tombstones = self.tombstones.lock().unwrap();
            for (id, entry) in &outcome.local_manifest.entries {
                if entry.is_tombstone() && !tombstones.is_retained(id) {
                    tombstones.record(id.clone());
                }
            }
            tombstones.cycle_completed(peer);
            let prunable = tombstones.prune();
            if !prunable.is_empty() {
                tracing::debug!(
                    "{} tombstones observed by all paired devices, prunable",
                    prunable.len()
                );
            }
        }

        self.last_activity.insert(peer, Instant::now());
        self.maybe_rotate(peer, session_id).await?;

        tracing::info!(
            "sync round with {} committed at local version {}",
            peer,
            committed
        );
        Ok(())
    }

    /// Ratchet the session keys if the configured round count elapsed.
    async fn maybe_rotate(&self, peer: DeviceId, session_id: SessionId) -> Result<(), SyncError> {
        if self.config.rotate_after_rounds == 0 {
            return Ok(());
        }

        let mut rounds = self.rounds_since_rotation.entry(peer).or_insert(0);
        *rounds += 1;
        if *rounds < self.config.rotate_after_rounds {
            return Ok(());
        }
        *rounds = 0;
        drop(rounds);

        // Tell the peer first - the message must go out under the old keys
        let next_epoch = self
            .sessions
            .session_info(session_id)
            .map(|(_, _, count)| count + 1)
            .ok_or(SyncError::NoSession(peer))?;
        self.send_message(
            peer,
            session_id,
            &SyncMessage::Rotate {
                rotation_count: next_epoch,
            },
        )
        .await?;
        self.sessions.rotate_session_keys(session_id)?;
        Ok(())
    }

    /// Serve incoming rounds from one paired peer until its session closes.
    ///
    /// Run this in its own task. Returns cleanly when the peer sends a
    /// session-close message or the transport channel ends.
    pub async fn serve_peer(&self, peer: DeviceId) -> Result<(), SyncError> {
        loop {
            let frame = match self.recv_frame_from(peer).await {
                Ok(frame) => frame,
                Err(SyncError::Transport(TransportError::ConnectionClosed)) => return Ok(()),
                Err(e) => return Err(e),
            };

            match frame.payload {
                FramePayload::Packet(packet) => {
                    // An authentication failure is fatal for the packet,
                    // not for the session.
                    let message = match self.sessions.decrypt_sync_data(&packet) {
                        Ok(message) => message,
                        Err(SessionError::AuthenticationFailed) => {
                            tracing::warn!("dropping unauthenticated packet from {}", peer);
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    };
                    match message {
                        SyncMessage::Manifest(manifest) => {
                            let session_id = packet.session_id;
                            if let Err(e) = self.responder_round(peer, session_id, manifest).await {
                                tracing::warn!("round with {} aborted: {}", peer, e);
                            }
                        }
                        SyncMessage::Rotate { rotation_count } => {
                            let rotated = self.sessions.rotate_session_keys(packet.session_id)?;
                            if rotated != rotation_count {
                                tracing::warn!(
                                    "rotation epoch skew with {}: ours {}, theirs {}",
                                    peer,
                                    rotated,
                                    rotation_count
                                );
                            }
                        }
                        SyncMessage::SessionClose { reason } => {
                            tracing::info!(
                                "peer {} closed the session ({})",
                                peer,
                                reason.as_deref().unwrap_or("no reason")
                            );
                            self.sessions.close_sync_session(packet.session_id)?;
                            return Ok(());
                        }
                        other => {
                            tracing::warn!(
                                "unexpected {:?} outside a round from {}",
                                message_kind(&other),
                                peer
                            );
                        }
                    }
                }
                FramePayload::KeyExchangeOffer(offer) => {
                    // Session refresh from an already-trusted peer
                    let peer_key = self
                        .trusted_peers
                        .get(&peer)
                        .map(|k| *k)
                        .ok_or_else(|| SyncError::Protocol("key exchange before pairing".into()))?;
                    let (_, answer) = self.sessions.accept_sync_session(peer, peer_key, &offer)?;
                    self.send_frame(peer, FramePayload::KeyExchangeAnswer(answer))
                        .await?;
                }
                other => {
                    tracing::warn!("unexpected frame from {}: {:?}", peer, frame_kind(&other));
                }
            }
        }
    }

    /// The responder half of a round, triggered by a received manifest.
    async fn responder_round(
        &self,
        peer: DeviceId,
        session_id: SessionId,
        remote: SyncManifest,
    ) -> Result<(), SyncError> {
        self.accept_manifest(&remote)?;

        let local = self.engine.build_manifest().await?;
        self.send_message(peer, session_id, &SyncMessage::Manifest(local.clone()))
            .await?;

        let result = diff(&local, &remote);
        let resolved = self.resolve_batch(&result)?;
        let entries_sent = self
            .send_transfers(peer, session_id, &local, &result, &resolved)
            .await?;
        self.send_message(
            peer,
            session_id,
            &SyncMessage::CommitAck {
                version: local.version,
            },
        )
        .await?;

        let entries_received = self.apply_until_ack(peer).await?;

        let outcome = RoundOutcome {
            remote_device: remote.device_id,
            remote_version: remote.version,
            local_manifest: local,
            entries_sent,
            entries_received,
            conflicts_resolved: result.conflicts.len(),
        };
        self.finish_round_responder(peer, &outcome).await?;
        self.emit(Some(peer), StatusEvent::SyncCompleted);
        Ok(())
    }

    /// Responder commit bookkeeping - no rotation (the initiator drives it).
    async fn finish_round_responder(
        &self,
        peer: DeviceId,
        outcome: &RoundOutcome,
    ) -> Result<(), SyncError> {
        {
            let mut versions = self.versions.lock().unwrap();
            versions.record(outcome.remote_device, outcome.remote_version);
        }
        self.engine.commit_version();

        {
            let mut tombstones = self.tombstones.lock().unwrap();
            for (id, entry) in &outcome.local_manifest.entries {
                if entry.is_tombstone() && !tombstones.is_retained(id) {
                    tombstones.record(id.clone());
                }
            }
            tombstones.cycle_completed(peer);
            tombstones.prune();
        }

        self.last_activity.insert(peer, Instant::now());
        Ok(())
    }

    /// Validate a received manifest and enforce monotonic versions.
    fn accept_manifest(&self, manifest: &SyncManifest) -> Result<(), SyncError> {
        validate_manifest(manifest)?;
        self.versions
            .lock()
            .unwrap()
            .check(manifest.device_id, manifest.version)?;
        Ok(())
    }

    /// Resolve every conflict with the deterministic batch policy.
    ///
    /// Both sides compute identical winners: last-writer-wins when
    /// configured or suggested, else the create-collision rule (smaller
    /// device id wins).
    fn resolve_batch(&self, result: &ManifestDiff) -> Result<Vec<ResolvedConflict>, SyncError> {
        result
            .conflicts
            .iter()
            .map(|conflict| {
                let policy = self.batch_policy(conflict);
                resolve(conflict, policy, None).map_err(SyncError::from)
            })
            .collect()
    }

    fn batch_policy(&self, conflict: &SyncConflict) -> ConflictResolution {
        // Only a symmetric policy converges without coordination: both
        // sides must pick the same winner independently. Directional
        // defaults (use-local would make *both* devices "win") are left
        // to interactive resolution.
        if self.config.default_resolution == Some(ConflictResolution::LastWriterWins)
            && resolution_options_for(conflict).contains(&ConflictResolution::LastWriterWins)
        {
            return ConflictResolution::LastWriterWins;
        }
        if let Some(suggested) = conflict.suggested {
            return suggested;
        }
        // Create collision: same deterministic tie-break as last-writer-wins
        if conflict.local_device < conflict.remote_device {
            ConflictResolution::UseLocal
        } else {
            ConflictResolution::UseRemote
        }
    }

    /// Ship the entries the peer lacks plus the conflict winners we own.
    async fn send_transfers(
        &self,
        peer: DeviceId,
        session_id: SessionId,
        local: &SyncManifest,
        result: &ManifestDiff,
        resolved: &[ResolvedConflict],
    ) -> Result<usize, SyncError> {
        let mut sent = 0;

        for id in &result.to_send {
            let entry = local.entries[id].clone();
            let payload = self.engine.read_payload(id).await?;
            self.send_message(peer, session_id, &SyncMessage::EntryData { entry, payload })
                .await?;
            sent += 1;
        }

        for resolution in resolved {
            // take_remote_payload is from our perspective: false means our
            // side won and the peer needs our copy
            if resolution.take_remote_payload {
                continue;
            }
            let payload = if resolution.entry.is_tombstone() {
                Vec::new()
            } else {
                self.engine.read_payload(&resolution.entry_id).await?
            };
            self.send_message(
                peer,
                session_id,
                &SyncMessage::EntryData {
                    entry: resolution.entry.clone(),
                    payload,
                },
            )
            .await?;
            sent += 1;
        }

        Ok(sent)
    }

    /// Apply incoming entry data until the peer's commit acknowledgement.
    async fn apply_until_ack(&self, peer: DeviceId) -> Result<usize, SyncError> {
        let mut applied = 0;
        loop {
            match self.recv_message_from(peer).await? {
                SyncMessage::EntryData { entry, payload } => {
                    if let Some(expected) = &entry.data_hash {
                        if !entry.is_tombstone() && &hash_payload(&payload) != expected {
                            return Err(SyncError::Protocol(format!(
                                "payload hash mismatch for {}",
                                entry.id
                            )));
                        }
                    }
                    let _write = self.vault_write_lock.lock().await;
                    self.engine.apply_remote_entry(&entry, payload).await?;
                    applied += 1;
                }
                SyncMessage::CommitAck { .. } => return Ok(applied),
                other => {
                    return Err(SyncError::Protocol(format!(
                        "expected entry data or commit ack, got {:?}",
                        message_kind(&other)
                    )))
                }
            }
        }
    }

    // ===========================================
    // Session lifecycle
    // ===========================================

    /// Close the session with a peer, telling it first.
    ///
    /// The explicit close message spares the peer from inferring closure
    /// out of decrypt failures.
    pub async fn close_session(&self, peer: DeviceId, reason: Option<String>) -> Result<(), SyncError> {
        let session_id = self
            .sessions
            .session_for_peer(peer)
            .ok_or(SyncError::NoSession(peer))?;

        self.send_message(peer, session_id, &SyncMessage::SessionClose { reason })
            .await?;
        self.sessions.close_sync_session(session_id)?;
        self.last_activity.remove(&peer);
        self.rounds_since_rotation.remove(&peer);
        Ok(())
    }

    /// Close sessions that have been idle past the keep-warm window.
    pub async fn retire_idle_sessions(&self) -> Vec<DeviceId> {
        let idle: Vec<DeviceId> = self
            .last_activity
            .iter()
            .filter(|entry| entry.value().elapsed() > self.config.keep_warm)
            .map(|entry| *entry.key())
            .collect();

        let mut retired = Vec::new();
        for peer in idle {
            if self.close_session(peer, Some("idle".into())).await.is_ok() {
                retired.push(peer);
            }
        }
        retired
    }

    // ===========================================
    // Plumbing
    // ===========================================

    /// Feed one event to a state machine snapshot, executing emit actions.
    fn advance(
        &self,
        peer: Option<DeviceId>,
        state: SyncState,
        event: Event,
    ) -> (SyncState, Vec<Action>) {
        let (next, actions) = state.on_event(event);
        for action in &actions {
            if let Action::EmitEvent(status) = action {
                self.emit(peer, status.clone());
            }
        }
        (next, actions)
    }

    fn emit(&self, peer: Option<DeviceId>, event: StatusEvent) {
        // Send fails only when nobody subscribed, which is fine
        let _ = self.events.send(PeerStatus { peer, event });
    }

    async fn send_frame(&self, peer: DeviceId, payload: FramePayload) -> Result<(), SyncError> {
        let bytes = Frame::new(payload).to_bytes()?;
        self.transport.send(peer, &bytes).await?;
        Ok(())
    }

    async fn send_message(
        &self,
        peer: DeviceId,
        session_id: SessionId,
        message: &SyncMessage,
    ) -> Result<(), SyncError> {
        let packet = self.sessions.encrypt_sync_data(session_id, message)?;
        self.send_frame(peer, FramePayload::Packet(packet)).await
    }

    /// Receive the next frame from a specific peer; frames from other
    /// peers are dropped with a warning (each peer has its own serving
    /// task in a multi-peer deployment).
    async fn recv_frame_from(&self, peer: DeviceId) -> Result<Frame, SyncError> {
        loop {
            let (from, bytes) = self.transport.recv().await?;
            if from != peer {
                tracing::warn!("dropping frame from {} while talking to {}", from, peer);
                continue;
            }
            return Ok(Frame::from_bytes(&bytes)?);
        }
    }

    async fn recv_message_from(&self, peer: DeviceId) -> Result<SyncMessage, SyncError> {
        match self.recv_frame_from(peer).await? {
            Frame {
                payload: FramePayload::Packet(packet),
                ..
            } => Ok(self.sessions.decrypt_sync_data(&packet)?),
            _ => Err(SyncError::Protocol("expected an encrypted packet".into())),
        }
    }

    /// Wait for a pairing response from any peer (the responder's id is
    /// not known until it answers).
    async fn recv_pairing_response(
        &self,
    ) -> Result<sync_types::PairingResponse, SyncError> {
        loop {
            let (from, bytes) = self.transport.recv().await?;
            match Frame::from_bytes(&bytes)? {
                Frame {
                    payload: FramePayload::PairingResponse(response),
                    ..
                } => {
                    if response.device_id != from {
                        tracing::warn!("pairing response claims {} but came from {}", response.device_id, from);
                        continue;
                    }
                    return Ok(response);
                }
                _ => {
                    tracing::warn!("dropping non-pairing frame from {} while waiting for a scan", from);
                }
            }
        }
    }
}

/// What one side learned from a completed round.
struct RoundOutcome {
    remote_device: DeviceId,
    remote_version: u64,
    local_manifest: SyncManifest,
    entries_sent: usize,
    entries_received: usize,
    conflicts_resolved: usize,
}

/// RAII guard serializing attempts per peer.
struct AttemptGuard<'a> {
    attempts: &'a DashMap<DeviceId, ()>,
    peer: DeviceId,
}

impl<'a> AttemptGuard<'a> {
    fn acquire(attempts: &'a DashMap<DeviceId, ()>, peer: DeviceId) -> Result<Self, SyncError> {
        use dashmap::mapref::entry::Entry;
        match attempts.entry(peer) {
            Entry::Occupied(_) => Err(SyncError::AttemptInProgress(peer)),
            Entry::Vacant(vacant) => {
                vacant.insert(());
                Ok(Self { attempts, peer })
            }
        }
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        self.attempts.remove(&self.peer);
    }
}

fn message_kind(message: &SyncMessage) -> &'static str {
    match message {
        SyncMessage::Manifest(_) => "manifest",
        SyncMessage::EntryRequest { .. } => "entry-request",
        SyncMessage::EntryData { .. } => "entry-data",
        SyncMessage::CommitAck { .. } => "commit-ack",
        SyncMessage::Rotate { .. } => "rotate",
        SyncMessage::SessionClose { .. } => "session-close",
    }
}

fn frame_kind(payload: &FramePayload) -> &'static str {
    match payload {
        FramePayload::PairingResponse(_) => "pairing-response",
        FramePayload::KeyExchangeOffer(_) => "key-exchange-offer",
        FramePayload::KeyExchangeAnswer(_) => "key-exchange-answer",
        FramePayload::Packet(_) => "packet",
    }
}
