//! Session negotiation state machine.
//!
//! The machine never performs I/O. Every input returns the [`Action`]s the caller has to carry
//! out (relay sends, transport calls, lifecycle events). Inputs arriving in a state where they
//! make no sense are rejected without touching the state, and the caller decides whether the
//! rejection is fatal via [`NegotiationError::is_fatal`].

use std::mem;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    address::Role,
    signaling::{Candidate, SdpKind, SessionDescription},
    transport::ConnectionStatus,
};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
pub enum SessionState {
    Idle,
    AwaitingRelay,
    AwaitingPeer,
    Negotiating,
    Connected,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub const ALL: [SessionState; 8] = [
        Self::Idle,
        Self::AwaitingRelay,
        Self::AwaitingPeer,
        Self::Negotiating,
        Self::Connected,
        Self::Closing,
        Self::Closed,
        Self::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            Self::AwaitingRelay | Self::AwaitingPeer | Self::Negotiating
        )
    }

    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, AwaitingRelay)
                | (AwaitingRelay, AwaitingPeer | Failed)
                | (AwaitingPeer, Negotiating | Failed)
                | (Negotiating, Connected | Failed)
                | (Connected, Closing | Failed)
                | (Closing, Closed)
        )
    }
}

/// Why a session left the connected path. Failures carry one of these to the presentation layer.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum EndReason {
    #[error("disconnected")]
    Disconnected,
    #[error("connection lost")]
    ConnectionLost,
    #[error("message channel closed")]
    ChannelClosed,
    #[error("could not reach the signaling server: {0}")]
    RelayRefused(String),
    #[error("signaling server connection lost: {0}")]
    RelayLinkLost(String),
    #[error("signaling server error: {0}")]
    RelayReported(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection failed before it was established")]
    NegotiationFailed,
    #[error("timed out in {0:?}")]
    TimedOut(SessionState),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Local,
    Remote,
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum NegotiationError {
    #[error("{0:?} description was already negotiated in this session")]
    DuplicateNegotiation(Direction),
    #[error("invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
    #[error("unexpected {kind:?} description for a {role}")]
    UnexpectedDescription { kind: SdpKind, role: Role },
    #[error("malformed remote description: {0}")]
    MalformedDescription(String),
    #[error("malformed remote candidate: {0}")]
    MalformedCandidate(String),
    #[error("{event} is not valid in {state:?}")]
    NotInState {
        event: &'static str,
        state: SessionState,
    },
}

impl NegotiationError {
    /// Malformed remote input ends the session; everything else is a rejected input.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MalformedDescription(_) | Self::MalformedCandidate(_)
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Action {
    StateChanged {
        from: SessionState,
        to: SessionState,
        reason: Option<EndReason>,
    },
    Join,
    CreateChannel,
    /// Create the description and install it locally.
    CreateLocalDescription(SdpKind),
    SetRemoteDescription(SessionDescription),
    AddRemoteCandidate(Candidate),
    SendDescription(SessionDescription),
    SendCandidate(Candidate),
    OpenDataSession,
    StartGraceTimer,
    Notice(String),
    /// Release the transport and relay link.
    Teardown,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Slot {
    Empty,
    Pending,
    Installed,
}

pub type Actions = Result<Vec<Action>, NegotiationError>;

pub struct Negotiator {
    role: Role,
    state: SessionState,
    local: Slot,
    remote: Slot,
    pending_candidates: Vec<Candidate>,
    /// Local candidates gathered before our description went out.
    unsent_candidates: Vec<Candidate>,
    channel_ready: bool,
    data_open: bool,
    degraded: bool,
    end_reason: Option<EndReason>,
}

impl Negotiator {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: SessionState::Idle,
            local: Slot::Empty,
            remote: Slot::Empty,
            pending_candidates: vec![],
            unsent_candidates: vec![],
            channel_ready: false,
            data_open: false,
            degraded: false,
            end_reason: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn end_reason(&self) -> Option<&EndReason> {
        self.end_reason.as_ref()
    }

    pub fn pending_candidates(&self) -> &[Candidate] {
        &self.pending_candidates
    }

    fn finished(&self) -> bool {
        matches!(
            self.state,
            SessionState::Closing | SessionState::Closed | SessionState::Failed
        )
    }

    fn transition(
        &mut self,
        to: SessionState,
        reason: Option<EndReason>,
    ) -> Result<Action, NegotiationError> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(NegotiationError::InvalidTransition { from, to });
        }
        debug!("session state {:?} -> {:?}", from, to);
        self.state = to;
        if reason.is_some() {
            self.end_reason = reason.clone();
        }
        if to.is_terminal() {
            self.pending_candidates.clear();
            self.unsent_candidates.clear();
        }
        Ok(Action::StateChanged { from, to, reason })
    }

    fn open_data(&mut self) -> Action {
        self.data_open = true;
        Action::OpenDataSession
    }

    /// The controller issued `connect()` on the relay.
    pub fn start(&mut self) -> Actions {
        Ok(vec![self.transition(SessionState::AwaitingRelay, None)?])
    }

    pub fn relay_connected(&mut self) -> Actions {
        let changed = self.transition(SessionState::AwaitingPeer, None)?;
        Ok(vec![Action::Join, changed])
    }

    /// The relay link is gone or the relay reported an error. Once connected the peers no longer
    /// need the relay.
    pub fn relay_failed(&mut self, reason: EndReason) -> Actions {
        match self.state {
            SessionState::Connected => {
                debug!("relay gone after connect: {}", reason);
                Ok(vec![])
            }
            _ => self.fail(reason),
        }
    }

    pub fn peer_joined(&mut self, peer_role: Option<Role>) -> Actions {
        if self.finished() {
            return Ok(vec![]);
        }
        if self.role == Role::Responder {
            trace!("peer joined, waiting for its offer");
            return Ok(vec![]);
        }
        if peer_role == Some(Role::Initiator) {
            return Ok(vec![Action::Notice(
                "Another sender joined this room, waiting for a receiver".to_owned(),
            )]);
        }
        if self.local != Slot::Empty {
            return Err(NegotiationError::DuplicateNegotiation(Direction::Local));
        }
        if self.state != SessionState::AwaitingPeer {
            return Err(NegotiationError::NotInState {
                event: "peer joined",
                state: self.state,
            });
        }
        let changed = self.transition(SessionState::Negotiating, None)?;
        self.local = Slot::Pending;
        Ok(vec![
            changed,
            Action::CreateChannel,
            Action::CreateLocalDescription(SdpKind::Offer),
        ])
    }

    /// The transport created and installed our description.
    pub fn local_description_ready(&mut self, desc: SessionDescription) -> Actions {
        if self.finished() {
            return Ok(vec![]);
        }
        match self.local {
            Slot::Pending => {}
            Slot::Installed => {
                return Err(NegotiationError::DuplicateNegotiation(Direction::Local));
            }
            Slot::Empty => {
                return Err(NegotiationError::NotInState {
                    event: "local description ready",
                    state: self.state,
                });
            }
        }
        self.local = Slot::Installed;
        let mut actions = vec![Action::SendDescription(desc)];
        actions.extend(
            mem::take(&mut self.unsent_candidates)
                .into_iter()
                .map(Action::SendCandidate),
        );
        Ok(actions)
    }

    pub fn remote_description(&mut self, desc: SessionDescription) -> Actions {
        if self.finished() {
            return Ok(vec![]);
        }
        if self.remote != Slot::Empty {
            return Err(NegotiationError::DuplicateNegotiation(Direction::Remote));
        }
        let expected = match self.role {
            Role::Initiator => SdpKind::Answer,
            Role::Responder => SdpKind::Offer,
        };
        if desc.kind != expected {
            return Err(NegotiationError::UnexpectedDescription {
                kind: desc.kind,
                role: self.role,
            });
        }
        desc.validate()
            .map_err(NegotiationError::MalformedDescription)?;

        let mut actions = vec![];
        match self.role {
            Role::Initiator => {
                if self.local == Slot::Empty || self.state != SessionState::Negotiating {
                    return Err(NegotiationError::NotInState {
                        event: "remote answer",
                        state: self.state,
                    });
                }
            }
            Role::Responder => {
                if self.state != SessionState::AwaitingPeer {
                    return Err(NegotiationError::NotInState {
                        event: "remote offer",
                        state: self.state,
                    });
                }
                actions.push(self.transition(SessionState::Negotiating, None)?);
            }
        }
        self.remote = Slot::Pending;
        actions.push(Action::SetRemoteDescription(desc));
        Ok(actions)
    }

    /// The transport accepted the remote description: buffered candidates can be applied now.
    pub fn remote_description_installed(&mut self) -> Actions {
        if self.finished() {
            return Ok(vec![]);
        }
        if self.remote != Slot::Pending {
            return Err(NegotiationError::NotInState {
                event: "remote description installed",
                state: self.state,
            });
        }
        if self.role == Role::Responder && self.local != Slot::Empty {
            return Err(NegotiationError::DuplicateNegotiation(Direction::Local));
        }
        self.remote = Slot::Installed;
        let mut actions = mem::take(&mut self.pending_candidates)
            .into_iter()
            .map(Action::AddRemoteCandidate)
            .collect::<Vec<_>>();
        if !actions.is_empty() {
            debug!("replaying {} buffered candidates", actions.len());
        }
        if self.role == Role::Responder {
            self.local = Slot::Pending;
            actions.push(Action::CreateLocalDescription(SdpKind::Answer));
        }
        Ok(actions)
    }

    pub fn remote_candidate(&mut self, candidate: Candidate) -> Actions {
        if self.finished() {
            trace!("discarding remote candidate in {:?}", self.state);
            return Ok(vec![]);
        }
        if candidate.is_end_of_candidates() {
            return Ok(vec![]);
        }
        candidate
            .validate()
            .map_err(NegotiationError::MalformedCandidate)?;
        if self.remote == Slot::Installed {
            return Ok(vec![Action::AddRemoteCandidate(candidate)]);
        }
        trace!("buffering remote candidate");
        self.pending_candidates.push(candidate);
        Ok(vec![])
    }

    /// Candidates only follow our description: anything gathered earlier waits for
    /// [`Negotiator::local_description_ready`].
    pub fn local_candidate(&mut self, candidate: Candidate) -> Actions {
        match self.state {
            SessionState::Negotiating | SessionState::Connected
                if self.local == Slot::Installed =>
            {
                Ok(vec![Action::SendCandidate(candidate)])
            }
            SessionState::AwaitingPeer | SessionState::Negotiating => {
                trace!("holding local candidate until our description is sent");
                self.unsent_candidates.push(candidate);
                Ok(vec![])
            }
            state => {
                trace!("not forwarding local candidate in {:?}", state);
                Ok(vec![])
            }
        }
    }

    pub fn transport_status(&mut self, status: ConnectionStatus) -> Actions {
        use ConnectionStatus as S;
        match (self.state, status) {
            (SessionState::Negotiating, S::Connected) => {
                let mut actions = vec![self.transition(SessionState::Connected, None)?];
                if self.channel_ready {
                    actions.push(self.open_data());
                }
                Ok(actions)
            }
            (SessionState::Connected, S::Connected) => {
                if mem::take(&mut self.degraded) {
                    return Ok(vec![Action::Notice("Connection recovered".to_owned())]);
                }
                Ok(vec![])
            }
            (SessionState::Negotiating, S::Disconnected | S::Failed | S::Closed) => {
                self.fail(EndReason::NegotiationFailed)
            }
            (SessionState::Connected, S::Disconnected) => {
                if self.degraded {
                    return Ok(vec![]);
                }
                self.degraded = true;
                Ok(vec![
                    Action::Notice("Connection problem detected, trying to recover...".to_owned()),
                    Action::StartGraceTimer,
                ])
            }
            (SessionState::Connected, S::Failed | S::Closed) => {
                self.fail(EndReason::ConnectionLost)
            }
            _ => Ok(vec![]),
        }
    }

    pub fn grace_expired(&mut self) -> Actions {
        if self.state == SessionState::Connected && self.degraded {
            return self.fail(EndReason::ConnectionLost);
        }
        Ok(vec![])
    }

    pub fn channel_open(&mut self) -> Actions {
        match self.state {
            SessionState::Connected if !self.data_open => Ok(vec![self.open_data()]),
            SessionState::Negotiating => {
                self.channel_ready = true;
                Ok(vec![])
            }
            _ => Ok(vec![]),
        }
    }

    pub fn channel_closed(&mut self) -> Actions {
        match self.state {
            SessionState::Connected => self.fail(EndReason::ChannelClosed),
            SessionState::Negotiating => self.fail(EndReason::NegotiationFailed),
            _ => Ok(vec![]),
        }
    }

    pub fn channel_error(&mut self, error: String) -> Actions {
        match self.state {
            SessionState::Connected => self.fail(EndReason::Transport(error)),
            SessionState::Negotiating => self.fail(EndReason::NegotiationFailed),
            _ => Ok(vec![]),
        }
    }

    pub fn timed_out(&mut self, state: SessionState) -> Actions {
        if self.state != state {
            return Ok(vec![]);
        }
        self.fail(EndReason::TimedOut(state))
    }

    /// Ends the session for `reason`. A connected session goes through Closing; anything earlier
    /// fails outright.
    pub fn fail(&mut self, reason: EndReason) -> Actions {
        match self.state {
            SessionState::Closing | SessionState::Closed | SessionState::Failed => Ok(vec![]),
            SessionState::Connected => Ok(vec![
                self.transition(SessionState::Closing, Some(reason))?,
                Action::Teardown,
            ]),
            _ => Ok(vec![
                self.transition(SessionState::Failed, Some(reason))?,
                Action::Teardown,
            ]),
        }
    }

    /// Explicit disconnect. Before Connected there is nothing to close gracefully, so the session
    /// fails with [`EndReason::Disconnected`].
    pub fn close(&mut self) -> Actions {
        match self.state {
            SessionState::Closing | SessionState::Closed | SessionState::Failed => Ok(vec![]),
            SessionState::Connected => Ok(vec![
                self.transition(SessionState::Closing, Some(EndReason::Disconnected))?,
                Action::Teardown,
            ]),
            _ => self.fail(EndReason::Disconnected),
        }
    }

    pub fn teardown_complete(&mut self) -> Actions {
        if self.state != SessionState::Closing {
            return Ok(vec![]);
        }
        let reason = self.end_reason.clone();
        Ok(vec![self.transition(SessionState::Closed, reason)?])
    }
}
