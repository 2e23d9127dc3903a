//! Per-peer link state machine.
//!
//! Each remote device gets its own [`PeerLinkState`]. The machine is pure: it
//! takes an event and returns the next state plus the actions the coordinator
//! must perform. A failure on one link never touches another link's state.

use std::time::Duration;

/// Reconnection policy for a single peer link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts allowed before the peer is evicted.
    pub max_attempts: u32,
    /// Delay unit; attempt `n` waits `base * 2^n` before jitter.
    pub base: Duration,
    /// Upper bound on the exponential part.
    pub cap: Duration,
    /// Upper bound on the random jitter added to every delay.
    pub max_jitter: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_jitter: Duration::from_millis(5000),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnection attempt `attempt`.
    ///
    /// Formula: min(cap, base * 2^attempt) + random(0..=max_jitter)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let base = self.base.saturating_mul(factor).min(self.cap);
        base + random_jitter(self.max_jitter)
    }
}

/// Link state for one peer - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerLinkState {
    /// Known candidate, no link open.
    Discovered,
    /// Dial in progress.
    Connecting,
    /// Transport open, waiting for the peer's `Hello`.
    Handshaking,
    /// Handshake complete, updates flowing.
    Connected,
    /// Link lost, waiting for the retry timer.
    Reconnecting {
        /// Number of reconnection attempts so far.
        attempt: u32,
    },
    /// Closed on request or after too many failures. Terminal for this link.
    Closed,
}

impl PeerLinkState {
    /// Create a new link in the Discovered state.
    pub fn new() -> Self {
        Self::Discovered
    }

    /// Process an event and return the new state plus actions to execute.
    pub fn on_event(self, event: LinkEvent, policy: &ReconnectPolicy) -> (Self, Vec<LinkAction>) {
        match (self, event) {
            // From Discovered
            (Self::Discovered, LinkEvent::DialRequested) => {
                (Self::Connecting, vec![LinkAction::Dial])
            }
            (Self::Discovered, LinkEvent::Accepted) => {
                (Self::Handshaking, vec![LinkAction::SendHello])
            }

            // From Connecting
            (Self::Connecting, LinkEvent::DialSucceeded) => {
                (Self::Handshaking, vec![LinkAction::SendHello])
            }
            (Self::Connecting, LinkEvent::DialFailed { error }) => {
                schedule_retry(1, error, policy)
            }

            // From Handshaking
            (Self::Handshaking, LinkEvent::HelloReceived) => (
                Self::Connected,
                vec![
                    LinkAction::SendMissing,
                    LinkAction::Emit(LinkNotice::Connected),
                ],
            ),
            (Self::Handshaking, LinkEvent::LinkLost { reason }) => {
                schedule_retry(1, reason, policy)
            }

            // From Connected
            (Self::Connected, LinkEvent::LinkLost { reason }) => {
                let (state, mut actions) = schedule_retry(1, reason.clone(), policy);
                actions.insert(0, LinkAction::Emit(LinkNotice::Disconnected { reason }));
                (state, actions)
            }
            (Self::Connected, LinkEvent::Silent) => (
                Self::Closed,
                vec![
                    LinkAction::Close,
                    LinkAction::Emit(LinkNotice::Disconnected {
                        reason: "peer silent".into(),
                    }),
                    LinkAction::Evict,
                ],
            ),

            // From Reconnecting
            (Self::Reconnecting { attempt }, LinkEvent::RetryTimer) => {
                (Self::Reconnecting { attempt }, vec![LinkAction::Dial])
            }
            (Self::Reconnecting { .. }, LinkEvent::DialSucceeded) => {
                (Self::Handshaking, vec![LinkAction::SendHello])
            }
            (Self::Reconnecting { .. }, LinkEvent::Accepted) => (
                Self::Handshaking,
                vec![LinkAction::CancelRetry, LinkAction::SendHello],
            ),
            (Self::Reconnecting { attempt }, LinkEvent::DialFailed { error }) => {
                schedule_retry(attempt.saturating_add(1), error, policy)
            }

            // Close requests from any live state
            (Self::Connected, LinkEvent::CloseRequested) => (
                Self::Closed,
                vec![
                    LinkAction::SendBye,
                    LinkAction::Close,
                    LinkAction::Emit(LinkNotice::Disconnected {
                        reason: "closed locally".into(),
                    }),
                ],
            ),
            (Self::Reconnecting { .. }, LinkEvent::CloseRequested) => {
                (Self::Closed, vec![LinkAction::CancelRetry])
            }
            (Self::Connecting | Self::Handshaking, LinkEvent::CloseRequested) => {
                (Self::Closed, vec![LinkAction::Close])
            }
            (Self::Discovered, LinkEvent::CloseRequested) => (Self::Closed, vec![]),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if the handshake has completed.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if the link is trying to (re)establish itself.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Handshaking | Self::Reconnecting { .. }
        )
    }
}

impl Default for PeerLinkState {
    fn default() -> Self {
        Self::new()
    }
}

fn schedule_retry(
    attempt: u32,
    error: String,
    policy: &ReconnectPolicy,
) -> (PeerLinkState, Vec<LinkAction>) {
    if attempt > policy.max_attempts {
        return (
            PeerLinkState::Closed,
            vec![
                LinkAction::Emit(LinkNotice::GaveUp { attempts: attempt - 1, error }),
                LinkAction::Evict,
            ],
        );
    }
    (
        PeerLinkState::Reconnecting { attempt },
        vec![
            LinkAction::Emit(LinkNotice::RetryScheduled {
                attempt,
                error,
            }),
            LinkAction::StartRetryTimer {
                delay: policy.delay(attempt),
            },
        ],
    )
}

/// Events that can occur on a peer link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Coordinator wants to open the link.
    DialRequested,
    /// The remote side opened the link to us.
    Accepted,
    /// Outbound dial succeeded.
    DialSucceeded,
    /// Outbound dial failed.
    DialFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// The peer's `Hello` arrived.
    HelloReceived,
    /// Transport reported an error or end of stream.
    LinkLost {
        /// Reason for disconnection.
        reason: String,
    },
    /// Peer exceeded the silence timeout.
    Silent,
    /// Coordinator is stopping or destroying the link.
    CloseRequested,
    /// Retry timer fired.
    RetryTimer,
}

/// Actions to be executed by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// Open a transport to the peer.
    Dial,
    /// Send our `Hello` with the local state vector.
    SendHello,
    /// Send the diff the peer lacks, based on its `Hello`.
    SendMissing,
    /// Send `Bye` before closing.
    SendBye,
    /// Close the transport.
    Close,
    /// Start a timer for the next reconnection attempt.
    StartRetryTimer {
        /// Delay before attempting reconnection.
        delay: std::time::Duration,
    },
    /// Cancel any pending retry timer.
    CancelRetry,
    /// Forget the peer entirely.
    Evict,
    /// Report a change to observers.
    Emit(LinkNotice),
}

/// Link-level notices surfaced to the coordinator's observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkNotice {
    /// Handshake finished.
    Connected,
    /// A previously connected link went down.
    Disconnected {
        /// Reason for disconnection.
        reason: String,
    },
    /// A reconnection attempt is scheduled.
    RetryScheduled {
        /// Which attempt is scheduled.
        attempt: u32,
        /// Error that caused the retry.
        error: String,
    },
    /// Reconnection attempts exhausted.
    GaveUp {
        /// Attempts made.
        attempts: u32,
        /// Last error.
        error: String,
    },
}

/// Generate random jitter between zero and `max` inclusive.
fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    Duration::from_millis(u64::from_le_bytes(bytes) % (max_ms + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy::default()
    }

    fn quick(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            base: Duration::from_millis(10),
            cap: Duration::from_millis(100),
            max_jitter: Duration::ZERO,
        }
    }

    #[test]
    fn starts_discovered() {
        assert_eq!(PeerLinkState::new(), PeerLinkState::Discovered);
    }

    #[test]
    fn dial_request_transitions_to_connecting() {
        let (state, actions) =
            PeerLinkState::Discovered.on_event(LinkEvent::DialRequested, &policy());

        assert_eq!(state, PeerLinkState::Connecting);
        assert_eq!(actions, vec![LinkAction::Dial]);
    }

    #[test]
    fn accepted_link_sends_hello() {
        let (state, actions) = PeerLinkState::Discovered.on_event(LinkEvent::Accepted, &policy());

        assert_eq!(state, PeerLinkState::Handshaking);
        assert!(actions.contains(&LinkAction::SendHello));
    }

    #[test]
    fn hello_completes_handshake() {
        let (state, actions) =
            PeerLinkState::Handshaking.on_event(LinkEvent::HelloReceived, &policy());

        assert!(state.is_connected());
        assert!(actions.contains(&LinkAction::SendMissing));
        assert!(actions.contains(&LinkAction::Emit(LinkNotice::Connected)));
    }

    #[test]
    fn dial_failure_schedules_retry() {
        let (state, actions) = PeerLinkState::Connecting.on_event(
            LinkEvent::DialFailed {
                error: "refused".into(),
            },
            &policy(),
        );

        assert_eq!(state, PeerLinkState::Reconnecting { attempt: 1 });
        assert!(actions
            .iter()
            .any(|a| matches!(a, LinkAction::StartRetryTimer { .. })));
    }

    #[test]
    fn link_lost_reports_disconnect_and_retries() {
        let (state, actions) = PeerLinkState::Connected.on_event(
            LinkEvent::LinkLost {
                reason: "reset".into(),
            },
            &policy(),
        );

        assert_eq!(state, PeerLinkState::Reconnecting { attempt: 1 });
        assert!(matches!(
            &actions[0],
            LinkAction::Emit(LinkNotice::Disconnected { reason }) if reason == "reset"
        ));
    }

    #[test]
    fn retry_failure_increments_attempt() {
        let (state, _) = PeerLinkState::Reconnecting { attempt: 2 }.on_event(
            LinkEvent::DialFailed {
                error: "timeout".into(),
            },
            &policy(),
        );

        assert_eq!(state, PeerLinkState::Reconnecting { attempt: 3 });
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let (state, actions) = PeerLinkState::Reconnecting { attempt: 2 }.on_event(
            LinkEvent::DialFailed {
                error: "timeout".into(),
            },
            &quick(2),
        );

        assert_eq!(state, PeerLinkState::Closed);
        assert!(actions.contains(&LinkAction::Evict));
        assert!(actions.iter().any(|a| matches!(
            a,
            LinkAction::Emit(LinkNotice::GaveUp { attempts: 2, .. })
        )));
    }

    #[test]
    fn retry_timer_dials_again() {
        let (state, actions) =
            PeerLinkState::Reconnecting { attempt: 1 }.on_event(LinkEvent::RetryTimer, &policy());

        assert_eq!(state, PeerLinkState::Reconnecting { attempt: 1 });
        assert_eq!(actions, vec![LinkAction::Dial]);
    }

    #[test]
    fn inbound_link_cancels_pending_retry() {
        let (state, actions) =
            PeerLinkState::Reconnecting { attempt: 3 }.on_event(LinkEvent::Accepted, &policy());

        assert_eq!(state, PeerLinkState::Handshaking);
        assert!(actions.contains(&LinkAction::CancelRetry));
    }

    #[test]
    fn silent_peer_is_evicted() {
        let (state, actions) = PeerLinkState::Connected.on_event(LinkEvent::Silent, &policy());

        assert_eq!(state, PeerLinkState::Closed);
        assert!(actions.contains(&LinkAction::Evict));
    }

    #[test]
    fn close_from_connected_says_bye() {
        let (state, actions) =
            PeerLinkState::Connected.on_event(LinkEvent::CloseRequested, &policy());

        assert_eq!(state, PeerLinkState::Closed);
        assert!(actions.contains(&LinkAction::SendBye));
        assert!(actions.contains(&LinkAction::Close));
    }

    #[test]
    fn close_from_reconnecting_cancels_timer() {
        let (state, actions) = PeerLinkState::Reconnecting { attempt: 1 }
            .on_event(LinkEvent::CloseRequested, &policy());

        assert_eq!(state, PeerLinkState::Closed);
        assert_eq!(actions, vec![LinkAction::CancelRetry]);
    }

    #[test]
    fn closed_ignores_everything() {
        for event in [
            LinkEvent::DialRequested,
            LinkEvent::HelloReceived,
            LinkEvent::RetryTimer,
        ] {
            let (state, actions) = PeerLinkState::Closed.on_event(event, &policy());
            assert_eq!(state, PeerLinkState::Closed);
            assert!(actions.is_empty());
        }
    }

    #[test]
    fn backoff_increases_with_attempt() {
        let p = policy();
        assert!(p.delay(1) >= Duration::from_secs(2));
        assert!(p.delay(3) >= Duration::from_secs(8));
    }

    #[test]
    fn backoff_capped_plus_jitter() {
        let delay = policy().delay(10);
        assert!(
            delay <= Duration::from_secs(35),
            "delay must be capped at 30s base + 5s jitter, got {:?}",
            delay
        );
    }

    #[test]
    fn jitter_creates_variance() {
        let p = policy();
        let delays: Vec<Duration> = (0..20).map(|_| p.delay(3)).collect();
        let min = delays.iter().min().unwrap();
        let max = delays.iter().max().unwrap();
        assert!(max.as_millis() - min.as_millis() >= 100);
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let p = quick(3);
        assert_eq!(p.delay(1), Duration::from_millis(20));
        assert_eq!(p.delay(10), Duration::from_millis(100));
    }

    #[test]
    fn helpers() {
        assert!(!PeerLinkState::Discovered.is_connecting());
        assert!(PeerLinkState::Handshaking.is_connecting());
        assert!(PeerLinkState::Reconnecting { attempt: 1 }.is_connecting());
        assert!(!PeerLinkState::Closed.is_connected());
    }
}
