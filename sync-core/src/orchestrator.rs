//! Sync attempt state machine - NO I/O, just state transitions.
//!
//! This module provides a pure, side-effect-free state machine for one
//! sync attempt with one peer. The machine takes events as input and
//! produces a new state plus a list of actions to execute.
//!
//! The actual I/O (transport, crypto, vault access) is performed by
//! sync-client, not by this module. This enables instant unit testing
//! without network mocks. One machine instance exists per (peer, attempt);
//! concurrent attempts with distinct peers each run their own machine.

use std::time::Duration;

/// Maximum manifest exchange attempts before the attempt fails.
pub const MAX_MANIFEST_ATTEMPTS: u32 = 3;

/// Sub-states of the pairing flow.
///
/// The inviter walks Generating → WaitingForScan → ExchangingKeys →
/// Verifying; the scanner walks Scanning → Connecting → ExchangingKeys →
/// Verifying. Both converge before session establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingPhase {
    /// Building an invitation and its challenge.
    Generating,
    /// Invitation is displayed, waiting for a peer to answer.
    WaitingForScan,
    /// Reading a peer's invitation.
    Scanning,
    /// Connecting to the address named in a scanned invitation.
    Connecting,
    /// Running the ephemeral key exchange.
    ExchangingKeys,
    /// Checking the challenge response and accepting the session.
    Verifying,
}

/// The state of one sync attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    /// No attempt in progress.
    Idle,
    /// Listening to the discovery feed.
    Discovering,
    /// Pairing with a peer.
    Pairing(PairingPhase),
    /// A forward-secret session is live.
    SessionEstablished,
    /// Exchanging manifests with the peer.
    ManifestExchange {
        /// Which attempt this is (1-based).
        attempt: u32,
    },
    /// The diff surfaced conflicts that are being resolved.
    ConflictResolution {
        /// Conflicts still awaiting a resolution.
        unresolved: usize,
    },
    /// Applying transfers and resolutions to the vault.
    Committing,
    /// The attempt failed; terminal until acknowledged.
    Failed {
        /// Human-readable failure reason.
        reason: String,
    },
    /// The invitation expired; terminal until acknowledged.
    Expired,
    /// The attempt was cancelled; terminal until acknowledged.
    Cancelled,
}

impl SyncState {
    /// Create a new state machine in the Idle state.
    pub fn new() -> Self {
        Self::Idle
    }

    /// Whether this is a terminal-per-attempt state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Expired | Self::Cancelled)
    }

    /// Whether a pairing flow is in progress.
    pub fn is_pairing(&self) -> bool {
        matches!(self, Self::Pairing(_))
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller (sync-client)
    /// is responsible for executing the returned actions, in order.
    pub fn on_event(self, event: Event) -> (Self, Vec<Action>) {
        match (self, event) {
            // From Idle
            (Self::Idle, Event::DiscoveryStarted) => (Self::Discovering, vec![]),
            (Self::Idle | Self::Discovering, Event::InvitationRequested) => (
                Self::Pairing(PairingPhase::Generating),
                vec![Action::GenerateInvitation],
            ),
            (Self::Idle | Self::Discovering, Event::ScanStarted) => {
                (Self::Pairing(PairingPhase::Scanning), vec![])
            }

            // Inviter path
            (Self::Pairing(PairingPhase::Generating), Event::InvitationReady) => (
                Self::Pairing(PairingPhase::WaitingForScan),
                vec![Action::EmitEvent(StatusEvent::InvitationReady)],
            ),
            (Self::Pairing(PairingPhase::WaitingForScan), Event::PeerConnected) => (
                Self::Pairing(PairingPhase::ExchangingKeys),
                vec![Action::StartKeyExchange],
            ),

            // Scanner path
            (Self::Pairing(PairingPhase::Scanning), Event::InvitationScanned) => (
                Self::Pairing(PairingPhase::Connecting),
                vec![Action::ConnectToPeer],
            ),
            (Self::Pairing(PairingPhase::Connecting), Event::PeerConnected) => (
                Self::Pairing(PairingPhase::ExchangingKeys),
                vec![Action::StartKeyExchange],
            ),

            // Converged pairing tail
            (Self::Pairing(PairingPhase::ExchangingKeys), Event::KeysExchanged) => (
                Self::Pairing(PairingPhase::Verifying),
                vec![Action::VerifyPairing],
            ),
            (Self::Pairing(PairingPhase::Verifying), Event::SessionAccepted) => (
                Self::SessionEstablished,
                vec![Action::EmitEvent(StatusEvent::SessionEstablished)],
            ),
            (Self::Pairing(PairingPhase::Verifying), Event::VerificationFailed { reason }) => (
                Self::Failed {
                    reason: reason.clone(),
                },
                vec![
                    Action::DiscardPairingMaterial,
                    Action::EmitEvent(StatusEvent::SyncFailed { reason }),
                ],
            ),
            (Self::Pairing(_), Event::InvitationExpired) => (
                Self::Expired,
                vec![
                    Action::DiscardPairingMaterial,
                    Action::EmitEvent(StatusEvent::PairingExpired),
                ],
            ),
            // Pairing has no auto-retry: a transport failure requires a
            // fresh invitation.
            (Self::Pairing(_), Event::TransportFailed { error }) => (
                Self::Failed {
                    reason: error.clone(),
                },
                vec![
                    Action::DiscardPairingMaterial,
                    Action::EmitEvent(StatusEvent::SyncFailed { reason: error }),
                ],
            ),

            // From SessionEstablished
            (Self::SessionEstablished, Event::SyncRequested) => (
                Self::ManifestExchange { attempt: 1 },
                vec![Action::ExchangeManifests],
            ),

            // From ManifestExchange
            (Self::ManifestExchange { .. }, Event::DiffComputed { conflicts }) => {
                if conflicts > 0 {
                    (
                        Self::ConflictResolution {
                            unresolved: conflicts,
                        },
                        vec![
                            Action::ResolveConflicts,
                            Action::EmitEvent(StatusEvent::ConflictsDetected { count: conflicts }),
                        ],
                    )
                } else {
                    (Self::Committing, vec![Action::ApplyChanges])
                }
            }
            (Self::ManifestExchange { attempt }, Event::TransportFailed { error }) => {
                if attempt < MAX_MANIFEST_ATTEMPTS {
                    let next_attempt = attempt + 1;
                    (
                        Self::ManifestExchange {
                            attempt: next_attempt,
                        },
                        vec![
                            Action::EmitEvent(StatusEvent::RetryScheduled {
                                attempt: next_attempt,
                            }),
                            Action::StartRetryTimer {
                                delay: retry_backoff(attempt),
                            },
                        ],
                    )
                } else {
                    (
                        Self::Failed {
                            reason: error.clone(),
                        },
                        vec![Action::EmitEvent(StatusEvent::SyncFailed { reason: error })],
                    )
                }
            }
            // Attempt counter was already advanced when the failure was
            // recorded; just restart the exchange.
            (Self::ManifestExchange { attempt }, Event::RetryTimerFired) => (
                Self::ManifestExchange { attempt },
                vec![Action::ExchangeManifests],
            ),
            (Self::ManifestExchange { .. }, Event::ExchangeTimedOut) => (
                Self::Failed {
                    reason: "manifest exchange timed out".into(),
                },
                vec![Action::EmitEvent(StatusEvent::SyncFailed {
                    reason: "manifest exchange timed out".into(),
                })],
            ),

            // From ConflictResolution
            (Self::ConflictResolution { .. }, Event::ConflictsResolved) => {
                (Self::Committing, vec![Action::ApplyChanges])
            }

            // From Committing
            (Self::Committing, Event::CommitCompleted) => (
                Self::Idle,
                vec![
                    Action::RetireSession,
                    Action::EmitEvent(StatusEvent::SyncCompleted),
                ],
            ),
            (Self::Committing, Event::TransportFailed { error }) => (
                Self::Failed {
                    reason: error.clone(),
                },
                vec![Action::EmitEvent(StatusEvent::SyncFailed { reason: error })],
            ),

            // Cancellation is safe at any non-terminal state: in-flight
            // pairing material is discarded and no partial session
            // survives.
            (state, Event::CancelRequested) if !state.is_terminal() => {
                if state == Self::Idle {
                    (Self::Idle, vec![])
                } else {
                    let mut actions = Vec::new();
                    if state.is_pairing() {
                        actions.push(Action::DiscardPairingMaterial);
                    } else {
                        actions.push(Action::CloseSession);
                    }
                    actions.push(Action::EmitEvent(StatusEvent::SyncCancelled));
                    (Self::Cancelled, actions)
                }
            }

            // Terminal states return to Idle once acknowledged
            (Self::Failed { .. } | Self::Expired | Self::Cancelled, Event::AttemptClosed) => {
                (Self::Idle, vec![])
            }

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

/// Events that can occur during a sync attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The discovery feed was started.
    DiscoveryStarted,
    /// The local device wants to invite a peer.
    InvitationRequested,
    /// The invitation (and its challenge) is ready to display.
    InvitationReady,
    /// The local device is about to scan a peer's invitation.
    ScanStarted,
    /// A QR payload was scanned and decoded.
    InvitationScanned,
    /// The transport connection to the peer is up.
    PeerConnected,
    /// The ephemeral key exchange finished.
    KeysExchanged,
    /// Challenge response verified and session accepted.
    SessionAccepted,
    /// Challenge response verification failed.
    VerificationFailed {
        /// Why verification failed.
        reason: String,
    },
    /// The invitation's validity window passed.
    InvitationExpired,
    /// A manifest round was requested on the established session.
    SyncRequested,
    /// The manifest diff is available.
    DiffComputed {
        /// Number of conflicts the diff surfaced.
        conflicts: usize,
    },
    /// All surfaced conflicts have a resolution.
    ConflictsResolved,
    /// Transfers and resolutions were applied to the vault.
    CommitCompleted,
    /// The transport failed.
    TransportFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// The retry timer fired.
    RetryTimerFired,
    /// The manifest exchange stalled past its deadline.
    ExchangeTimedOut,
    /// The caller cancelled the attempt.
    CancelRequested,
    /// A terminal state was acknowledged.
    AttemptClosed,
}

/// Actions to be executed by the sync-client.
///
/// These are instructions, not side effects. The sync-client interprets
/// them and performs the actual I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Build a pairing invitation with a fresh challenge.
    GenerateInvitation,
    /// Connect the transport to the scanned peer.
    ConnectToPeer,
    /// Run the ephemeral key exchange.
    StartKeyExchange,
    /// Verify the pairing response and accept the session.
    VerifyPairing,
    /// Build, send and receive manifests, then compute the diff.
    ExchangeManifests,
    /// Apply the configured policy (or collect choices) for each conflict.
    ResolveConflicts,
    /// Apply transfers and resolutions to the vault store.
    ApplyChanges,
    /// Close or keep the session warm, per policy.
    RetireSession,
    /// Close the session immediately.
    CloseSession,
    /// Zeroize in-flight key material from an unfinished pairing.
    DiscardPairingMaterial,
    /// Start a timer for the next manifest exchange attempt.
    StartRetryTimer {
        /// Delay before the retry.
        delay: Duration,
    },
    /// Emit a status event to the application.
    EmitEvent(StatusEvent),
}

/// Status events emitted to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// An invitation is ready to display as a QR code.
    InvitationReady,
    /// Pairing verified and a session is live.
    SessionEstablished,
    /// The diff surfaced conflicts.
    ConflictsDetected {
        /// How many conflicts were found.
        count: usize,
    },
    /// A manifest exchange retry was scheduled.
    RetryScheduled {
        /// Which attempt will run next (1-based).
        attempt: u32,
    },
    /// The attempt committed successfully.
    SyncCompleted,
    /// The attempt failed.
    SyncFailed {
        /// Human-readable reason.
        reason: String,
    },
    /// The invitation expired before pairing completed.
    PairingExpired,
    /// The attempt was cancelled.
    SyncCancelled,
}

/// Calculate manifest retry backoff with jitter.
///
/// Exponential backoff with random jitter so two devices retrying against
/// each other do not stay in lockstep.
///
/// Formula: min(10s, 2^attempt seconds) + random(0..1000ms)
pub fn retry_backoff(attempt: u32) -> Duration {
    let base_secs = 2u64.pow(attempt.min(3)).min(10);
    let base = Duration::from_secs(base_secs);

    let jitter = Duration::from_millis(random_jitter_ms());
    base + jitter
}

/// Generate random jitter between 0 and 1000 milliseconds.
fn random_jitter_ms() -> u64 {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    u64::from_le_bytes(bytes) % 1001
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle() {
        assert_eq!(SyncState::new(), SyncState::Idle);
    }

    // ===========================================
    // Pairing - inviter path
    // ===========================================

    #[test]
    fn inviter_walks_generating_to_waiting() {
        let (state, actions) = SyncState::Idle.on_event(Event::InvitationRequested);
        assert_eq!(state, SyncState::Pairing(PairingPhase::Generating));
        assert!(actions.contains(&Action::GenerateInvitation));

        let (state, actions) = state.on_event(Event::InvitationReady);
        assert_eq!(state, SyncState::Pairing(PairingPhase::WaitingForScan));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::EmitEvent(StatusEvent::InvitationReady))));
    }

    #[test]
    fn inviter_reaches_session_established() {
        let state = SyncState::Pairing(PairingPhase::WaitingForScan);

        let (state, actions) = state.on_event(Event::PeerConnected);
        assert_eq!(state, SyncState::Pairing(PairingPhase::ExchangingKeys));
        assert!(actions.contains(&Action::StartKeyExchange));

        let (state, actions) = state.on_event(Event::KeysExchanged);
        assert_eq!(state, SyncState::Pairing(PairingPhase::Verifying));
        assert!(actions.contains(&Action::VerifyPairing));

        let (state, actions) = state.on_event(Event::SessionAccepted);
        assert_eq!(state, SyncState::SessionEstablished);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::EmitEvent(StatusEvent::SessionEstablished))));
    }

    // ===========================================
    // Pairing - scanner path
    // ===========================================

    #[test]
    fn scanner_walks_scanning_to_exchanging() {
        let (state, _) = SyncState::Idle.on_event(Event::ScanStarted);
        assert_eq!(state, SyncState::Pairing(PairingPhase::Scanning));

        let (state, actions) = state.on_event(Event::InvitationScanned);
        assert_eq!(state, SyncState::Pairing(PairingPhase::Connecting));
        assert!(actions.contains(&Action::ConnectToPeer));

        let (state, actions) = state.on_event(Event::PeerConnected);
        assert_eq!(state, SyncState::Pairing(PairingPhase::ExchangingKeys));
        assert!(actions.contains(&Action::StartKeyExchange));
    }

    // ===========================================
    // Pairing failures
    // ===========================================

    #[test]
    fn verification_failure_discards_material() {
        let state = SyncState::Pairing(PairingPhase::Verifying);
        let (state, actions) = state.on_event(Event::VerificationFailed {
            reason: "challenge mismatch".into(),
        });

        assert!(matches!(state, SyncState::Failed { .. }));
        assert!(actions.contains(&Action::DiscardPairingMaterial));
    }

    #[test]
    fn expiry_is_terminal_from_any_pairing_phase() {
        for phase in [
            PairingPhase::Generating,
            PairingPhase::WaitingForScan,
            PairingPhase::Scanning,
            PairingPhase::Connecting,
            PairingPhase::ExchangingKeys,
            PairingPhase::Verifying,
        ] {
            let (state, actions) = SyncState::Pairing(phase).on_event(Event::InvitationExpired);
            assert_eq!(state, SyncState::Expired);
            assert!(actions.contains(&Action::DiscardPairingMaterial));
        }
    }

    #[test]
    fn pairing_transport_failure_does_not_retry() {
        let state = SyncState::Pairing(PairingPhase::ExchangingKeys);
        let (state, actions) = state.on_event(Event::TransportFailed {
            error: "connection reset".into(),
        });

        assert!(matches!(state, SyncState::Failed { .. }));
        assert!(
            !actions
                .iter()
                .any(|a| matches!(a, Action::StartRetryTimer { .. })),
            "pairing requires a fresh invitation, never auto-retries"
        );
    }

    // ===========================================
    // Manifest exchange
    // ===========================================

    #[test]
    fn sync_request_starts_manifest_exchange() {
        let (state, actions) = SyncState::SessionEstablished.on_event(Event::SyncRequested);
        assert_eq!(state, SyncState::ManifestExchange { attempt: 1 });
        assert!(actions.contains(&Action::ExchangeManifests));
    }

    #[test]
    fn clean_diff_skips_conflict_resolution() {
        let state = SyncState::ManifestExchange { attempt: 1 };
        let (state, actions) = state.on_event(Event::DiffComputed { conflicts: 0 });

        assert_eq!(state, SyncState::Committing);
        assert!(actions.contains(&Action::ApplyChanges));
    }

    #[test]
    fn conflicted_diff_enters_resolution() {
        let state = SyncState::ManifestExchange { attempt: 1 };
        let (state, actions) = state.on_event(Event::DiffComputed { conflicts: 4 });

        assert_eq!(state, SyncState::ConflictResolution { unresolved: 4 });
        assert!(actions.contains(&Action::ResolveConflicts));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::EmitEvent(StatusEvent::ConflictsDetected { count: 4 }))));
    }

    #[test]
    fn resolution_leads_to_commit() {
        let state = SyncState::ConflictResolution { unresolved: 2 };
        let (state, actions) = state.on_event(Event::ConflictsResolved);

        assert_eq!(state, SyncState::Committing);
        assert!(actions.contains(&Action::ApplyChanges));
    }

    #[test]
    fn commit_returns_to_idle_and_retires_session() {
        let (state, actions) = SyncState::Committing.on_event(Event::CommitCompleted);

        assert_eq!(state, SyncState::Idle);
        assert!(actions.contains(&Action::RetireSession));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::EmitEvent(StatusEvent::SyncCompleted))));
    }

    // ===========================================
    // Manifest retry
    // ===========================================

    #[test]
    fn manifest_failure_schedules_bounded_retries() {
        let state = SyncState::ManifestExchange { attempt: 1 };
        let (state, actions) = state.on_event(Event::TransportFailed {
            error: "timeout".into(),
        });

        assert_eq!(state, SyncState::ManifestExchange { attempt: 2 });
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::StartRetryTimer { .. })));

        let (state, _) = state.on_event(Event::RetryTimerFired);
        assert_eq!(state, SyncState::ManifestExchange { attempt: 2 });

        let (state, _) = state.on_event(Event::TransportFailed {
            error: "timeout".into(),
        });
        assert_eq!(state, SyncState::ManifestExchange { attempt: 3 });
    }

    #[test]
    fn manifest_failure_at_attempt_cap_fails() {
        let state = SyncState::ManifestExchange {
            attempt: MAX_MANIFEST_ATTEMPTS,
        };
        let (state, actions) = state.on_event(Event::TransportFailed {
            error: "unreachable".into(),
        });

        assert!(matches!(state, SyncState::Failed { .. }));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::StartRetryTimer { .. })));
    }

    #[test]
    fn retry_timer_restarts_the_exchange() {
        let state = SyncState::ManifestExchange { attempt: 2 };
        let (state, actions) = state.on_event(Event::RetryTimerFired);

        assert_eq!(state, SyncState::ManifestExchange { attempt: 2 });
        assert!(actions.contains(&Action::ExchangeManifests));
    }

    #[test]
    fn stalled_exchange_times_out_to_failed() {
        let state = SyncState::ManifestExchange { attempt: 1 };
        let (state, _) = state.on_event(Event::ExchangeTimedOut);
        assert!(matches!(state, SyncState::Failed { .. }));
    }

    #[test]
    fn retry_backoff_grows_and_is_capped() {
        let d1 = retry_backoff(1);
        let d3 = retry_backoff(3);
        assert!(d1 >= Duration::from_secs(2));
        assert!(d3 >= Duration::from_secs(8));

        // Cap: 10s base + 1s jitter
        let d10 = retry_backoff(10);
        assert!(d10 <= Duration::from_secs(11));
    }

    // ===========================================
    // Cancellation
    // ===========================================

    #[test]
    fn cancel_during_pairing_discards_material() {
        let state = SyncState::Pairing(PairingPhase::ExchangingKeys);
        let (state, actions) = state.on_event(Event::CancelRequested);

        assert_eq!(state, SyncState::Cancelled);
        assert!(actions.contains(&Action::DiscardPairingMaterial));
        assert!(!actions.contains(&Action::CloseSession));
    }

    #[test]
    fn cancel_after_session_closes_it() {
        let state = SyncState::ManifestExchange { attempt: 1 };
        let (state, actions) = state.on_event(Event::CancelRequested);

        assert_eq!(state, SyncState::Cancelled);
        assert!(actions.contains(&Action::CloseSession));
    }

    #[test]
    fn cancel_while_idle_is_a_no_op() {
        let (state, actions) = SyncState::Idle.on_event(Event::CancelRequested);
        assert_eq!(state, SyncState::Idle);
        assert!(actions.is_empty());
    }

    // ===========================================
    // Terminal handling
    // ===========================================

    #[test]
    fn terminal_states_return_to_idle_when_closed() {
        for terminal in [
            SyncState::Failed {
                reason: "x".into(),
            },
            SyncState::Expired,
            SyncState::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            let (state, actions) = terminal.on_event(Event::AttemptClosed);
            assert_eq!(state, SyncState::Idle);
            assert!(actions.is_empty());
        }
    }

    #[test]
    fn invalid_transitions_keep_state() {
        let (state, actions) = SyncState::Idle.on_event(Event::CommitCompleted);
        assert_eq!(state, SyncState::Idle);
        assert!(actions.is_empty());

        let (state, actions) =
            SyncState::SessionEstablished.on_event(Event::InvitationScanned);
        assert_eq!(state, SyncState::SessionEstablished);
        assert!(actions.is_empty());
    }
}
