//! Rendezvous states and the transition function.
//!
//! [`transition`] is pure: it maps the current state, the active controller
//! and one input onto a [`Transition`]. The session driver performs the I/O
//! each controller stands for and feeds the results back in as inputs.

use crate::error::{AttemptFailure, FailureReason};
use crate::timeout::{ConnectionType, Initiator};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum State {
    Initiating,
    AwaitingPeerAck,
    AttemptingDirect(ConnectionType),
    AttemptingProxy,
    Transferring,
    Paused,
    Completed,
    Failed(FailureReason),
    Cancelled,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Completed | State::Failed(_) | State::Cancelled)
    }

    pub fn name(&self) -> &'static str {
        match self {
            State::Initiating => "initiating",
            State::AwaitingPeerAck => "awaiting_peer_ack",
            State::AttemptingDirect(_) => "attempting_direct",
            State::AttemptingProxy => "attempting_proxy",
            State::Transferring => "transferring",
            State::Paused => "paused",
            State::Completed => "completed",
            State::Failed(_) => "failed",
            State::Cancelled => "cancelled",
        }
    }
}

/// The unit of work the driver is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Controller {
    /// Send our proposal to the peer.
    Propose,
    /// Accept the peer's connection on our advertised port.
    Listen,
    /// Connect to the address the peer advertised.
    ConnectOut,
    /// Open a relay session and invite the peer to it.
    ProxyInitiate,
    /// Join the relay session the peer advertised.
    ProxyJoin,
    /// Move the file data.
    Transfer,
    /// Nothing left to run.
    Idle,
}

/// Something that happened, as seen by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    ProposalSent,
    PeerAccepted,
    /// The peer sent a (possibly redirected) proposal.
    PeerProposed { use_proxy: bool },
    Connected,
    AttemptFailed(AttemptFailure),
    TransferFinished,
    TransferFailed(FailureReason),
    Pause,
    Resume,
    Cancel,
    PeerCancelled,
}

/// Notable outcomes reported to the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "detail", rename_all = "snake_case")]
pub enum RendezvousEvent {
    ProposalSent,
    Connected { proxied: bool },
    FallingBack(AttemptFailure),
    Paused,
    Resumed,
    Completed,
    Failed(FailureReason),
    Cancelled { by_peer: bool },
}

/// Fixed facts about a session the transitions depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    pub initiator: Initiator,
    pub connection_type: ConnectionType,
    pub allow_proxy: bool,
}

/// Result of one step. `None` leaves that dimension unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transition {
    pub next_controller: Option<Controller>,
    pub next_state: Option<State>,
    pub event: Option<RendezvousEvent>,
}

impl Transition {
    pub fn none() -> Self {
        Self::default()
    }

    fn to(controller: Controller, state: State) -> Self {
        Self {
            next_controller: Some(controller),
            next_state: Some(state),
            event: None,
        }
    }

    fn with_event(mut self, event: RendezvousEvent) -> Self {
        self.event = Some(event);
        self
    }

    fn terminal(state: State, event: RendezvousEvent) -> Self {
        Self::to(Controller::Idle, state).with_event(event)
    }

    fn failed(reason: FailureReason) -> Self {
        Self::terminal(State::Failed(reason.clone()), RendezvousEvent::Failed(reason))
    }

    pub fn is_none(&self) -> bool {
        self.next_controller.is_none() && self.next_state.is_none() && self.event.is_none()
    }
}

/// Where the first step of a session starts.
pub fn initial(plan: &Plan) -> (State, Controller) {
    match plan.initiator {
        Initiator::Local => (State::Initiating, Controller::Propose),
        // The buddy's proposal is fed in as the first input.
        Initiator::Buddy => (State::Initiating, Controller::Idle),
    }
}

pub fn transition(plan: &Plan, state: &State, controller: Controller, input: Input) -> Transition {
    if state.is_terminal() {
        return Transition::none();
    }

    match input {
        Input::Cancel => {
            return Transition::terminal(State::Cancelled, RendezvousEvent::Cancelled { by_peer: false })
        }
        Input::PeerCancelled => {
            return Transition::terminal(State::Cancelled, RendezvousEvent::Cancelled { by_peer: true })
        }
        _ => {}
    }

    match (state, input) {
        (State::Initiating, Input::ProposalSent) => {
            Transition::to(Controller::Listen, State::AwaitingPeerAck).with_event(RendezvousEvent::ProposalSent)
        }

        // A proposal from the peer redirects any connection attempt.
        (
            State::Initiating | State::AwaitingPeerAck | State::AttemptingDirect(_) | State::AttemptingProxy,
            Input::PeerProposed { use_proxy: true },
        ) => Transition::to(Controller::ProxyJoin, State::AttemptingProxy),
        (
            State::Initiating | State::AwaitingPeerAck | State::AttemptingDirect(_),
            Input::PeerProposed { use_proxy: false },
        ) => Transition::to(Controller::ConnectOut, State::AttemptingDirect(plan.connection_type)),

        (State::AwaitingPeerAck, Input::PeerAccepted) => Transition {
            next_controller: None,
            next_state: Some(State::AttemptingDirect(plan.connection_type)),
            event: None,
        },
        // The proposal never left.
        (State::Initiating, Input::AttemptFailed(failure)) => Transition::failed(FailureReason::Unreachable(failure)),
        (State::AwaitingPeerAck, Input::AttemptFailed(_)) => Transition::failed(FailureReason::NoResponse),

        (State::AwaitingPeerAck | State::AttemptingDirect(_), Input::Connected) => {
            Transition::to(Controller::Transfer, State::Transferring)
                .with_event(RendezvousEvent::Connected { proxied: false })
        }
        (State::AttemptingProxy, Input::Connected) => Transition::to(Controller::Transfer, State::Transferring)
            .with_event(RendezvousEvent::Connected { proxied: true }),

        (State::AttemptingDirect(_), Input::AttemptFailed(failure)) => {
            if plan.allow_proxy {
                Transition::to(Controller::ProxyInitiate, State::AttemptingProxy)
                    .with_event(RendezvousEvent::FallingBack(failure))
            } else {
                Transition::failed(FailureReason::Unreachable(failure))
            }
        }
        (State::AttemptingProxy, Input::AttemptFailed(failure)) => {
            if controller == Controller::ProxyJoin && plan.allow_proxy {
                Transition {
                    next_controller: Some(Controller::ProxyInitiate),
                    next_state: None,
                    event: Some(RendezvousEvent::FallingBack(failure)),
                }
            } else {
                Transition::failed(FailureReason::Unreachable(failure))
            }
        }

        (State::Transferring, Input::Pause) => Transition {
            next_controller: None,
            next_state: Some(State::Paused),
            event: Some(RendezvousEvent::Paused),
        },
        (State::Paused, Input::Resume) => Transition {
            next_controller: None,
            next_state: Some(State::Transferring),
            event: Some(RendezvousEvent::Resumed),
        },
        (State::Transferring | State::Paused, Input::TransferFinished) => {
            Transition::terminal(State::Completed, RendezvousEvent::Completed)
        }
        (State::Transferring | State::Paused, Input::TransferFailed(reason)) => Transition::failed(reason),

        _ => Transition::none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(initiator: Initiator, allow_proxy: bool) -> Plan {
        Plan {
            initiator,
            connection_type: ConnectionType::Internet,
            allow_proxy,
        }
    }

    /// Runs `inputs` from the plan's initial position and returns every
    /// state visited plus the events emitted.
    fn drive(plan: &Plan, inputs: Vec<Input>) -> (Vec<State>, Vec<RendezvousEvent>) {
        let (mut state, mut controller) = initial(plan);
        let mut states = vec![state.clone()];
        let mut events = Vec::new();
        for input in inputs {
            let t = transition(plan, &state, controller, input);
            if let Some(c) = t.next_controller {
                controller = c;
            }
            if let Some(s) = t.next_state {
                state = s;
                states.push(state.clone());
            }
            events.extend(t.event);
        }
        (states, events)
    }

    #[test]
    fn test_local_direct_happy_path() {
        let p = plan(Initiator::Local, true);
        let (states, events) = drive(
            &p,
            vec![Input::ProposalSent, Input::PeerAccepted, Input::Connected, Input::TransferFinished],
        );
        assert_eq!(
            states,
            vec![
                State::Initiating,
                State::AwaitingPeerAck,
                State::AttemptingDirect(ConnectionType::Internet),
                State::Transferring,
                State::Completed,
            ]
        );
        assert_eq!(
            events,
            vec![
                RendezvousEvent::ProposalSent,
                RendezvousEvent::Connected { proxied: false },
                RendezvousEvent::Completed,
            ]
        );
    }

    #[test]
    fn test_direct_timeout_falls_back_to_proxy() {
        let p = plan(Initiator::Buddy, true);
        let state = State::AttemptingDirect(ConnectionType::Internet);
        let t = transition(&p, &state, Controller::ConnectOut, Input::AttemptFailed(AttemptFailure::TimedOut));
        assert_eq!(t.next_state, Some(State::AttemptingProxy));
        assert_eq!(t.next_controller, Some(Controller::ProxyInitiate));
        assert_eq!(t.event, Some(RendezvousEvent::FallingBack(AttemptFailure::TimedOut)));
    }

    #[test]
    fn test_no_proxy_fails_after_direct() {
        let p = plan(Initiator::Local, false);
        let state = State::AttemptingDirect(ConnectionType::Lan);
        let t = transition(&p, &state, Controller::Listen, Input::AttemptFailed(AttemptFailure::Refused));
        assert_eq!(t.next_state, Some(State::Failed(FailureReason::Unreachable(AttemptFailure::Refused))));
        assert_eq!(t.next_controller, Some(Controller::Idle));
    }

    #[test]
    fn test_exhausting_all_routes() {
        let p = plan(Initiator::Buddy, true);
        let (states, events) = drive(
            &p,
            vec![
                Input::PeerProposed { use_proxy: true },
                Input::AttemptFailed(AttemptFailure::Refused),
                Input::AttemptFailed(AttemptFailure::Relay(4)),
                // Ignored once terminal
                Input::Connected,
            ],
        );
        assert_eq!(
            states,
            vec![
                State::Initiating,
                State::AttemptingProxy,
                State::Failed(FailureReason::Unreachable(AttemptFailure::Relay(4))),
            ]
        );
        let failures = events
            .iter()
            .filter(|e| matches!(e, RendezvousEvent::Failed(_)))
            .count();
        assert_eq!(failures, 1);
    }

    #[test]
    fn test_unanswered_proposal() {
        let p = plan(Initiator::Local, true);
        let t = transition(&p, &State::AwaitingPeerAck, Controller::Listen, Input::AttemptFailed(AttemptFailure::TimedOut));
        assert_eq!(t.next_state, Some(State::Failed(FailureReason::NoResponse)));
    }

    #[test]
    fn test_failed_proposal_is_terminal() {
        let p = plan(Initiator::Local, true);
        let failure = AttemptFailure::Io("server gone".to_string());
        let t = transition(&p, &State::Initiating, Controller::Propose, Input::AttemptFailed(failure.clone()));
        assert_eq!(t.next_state, Some(State::Failed(FailureReason::Unreachable(failure))));
        assert_eq!(t.next_controller, Some(Controller::Idle));
    }

    #[test]
    fn test_accept_keeps_listening() {
        let p = plan(Initiator::Local, true);
        let t = transition(&p, &State::AwaitingPeerAck, Controller::Listen, Input::PeerAccepted);
        assert_eq!(t.next_controller, None);
        assert_eq!(t.next_state, Some(State::AttemptingDirect(ConnectionType::Internet)));
        assert!(t.event.is_none());
    }

    #[test]
    fn test_pause_resume() {
        let p = plan(Initiator::Local, true);
        let t = transition(&p, &State::Transferring, Controller::Transfer, Input::Pause);
        assert_eq!(t.next_state, Some(State::Paused));
        assert_eq!(t.next_controller, None);
        let t = transition(&p, &State::Paused, Controller::Transfer, Input::Resume);
        assert_eq!(t.next_state, Some(State::Transferring));
        assert!(transition(&p, &State::Transferring, Controller::Transfer, Input::Resume).is_none());
    }

    #[test]
    fn test_cancel_from_any_live_state() {
        let p = plan(Initiator::Local, true);
        for state in [
            State::Initiating,
            State::AwaitingPeerAck,
            State::AttemptingDirect(ConnectionType::Lan),
            State::AttemptingProxy,
            State::Transferring,
            State::Paused,
        ] {
            let t = transition(&p, &state, Controller::Transfer, Input::Cancel);
            assert_eq!(t.next_state, Some(State::Cancelled));
            assert_eq!(t.next_controller, Some(Controller::Idle));
        }
        let t = transition(&p, &State::Transferring, Controller::Transfer, Input::PeerCancelled);
        assert_eq!(t.event, Some(RendezvousEvent::Cancelled { by_peer: true }));
    }

    #[test]
    fn test_terminal_states_absorb_input() {
        let p = plan(Initiator::Local, true);
        for state in [State::Completed, State::Cancelled, State::Failed(FailureReason::Stalled)] {
            assert!(transition(&p, &state, Controller::Idle, Input::Cancel).is_none());
            assert!(transition(&p, &state, Controller::Idle, Input::Connected).is_none());
        }
    }

    #[test]
    fn test_proxy_never_returns_to_direct() {
        let p = plan(Initiator::Local, true);
        let t = transition(
            &p,
            &State::AttemptingProxy,
            Controller::ProxyInitiate,
            Input::PeerProposed { use_proxy: false },
        );
        assert!(t.is_none());
    }
}
