use std::{sync::Arc, time::Duration};

use derive_new::new;
use tokio::{sync::mpsc, task::JoinHandle, time::sleep};
use tracing::{debug, error, info, trace, warn};

use crate::{
    address::{Role, RoomKey},
    data_session::DataSession,
    negotiation::{Action, Actions, EndReason, Negotiator, SessionState},
    relay::{RelayConnector, RelayError, RelayEvent, RelayEvents, RelayHandle},
    signaling::{Envelope, Payload, SdpKind},
    transport::{Transport, TransportError, TransportEvent, TransportEvents, TransportFactory},
};

use super::{
    worker::{self, OpOutcome, TransportOp},
    Context, SessionEvent,
};

pub(crate) struct Attached {
    relay: RelayHandle,
    relay_events: RelayEvents,
    transport: Arc<dyn Transport>,
    transport_events: TransportEvents,
}

pub(crate) enum SessionInput {
    Attached(Result<Attached, EndReason>),
    Relay(RelayEvent),
    Transport(TransportEvent),
    Op(OpOutcome),
    SendFailed(TransportError),
    Timeout(SessionState),
    GraceExpired,
    TeardownComplete,
}

/// An input produced by an async continuation of the session numbered `generation`.
#[derive(new)]
pub(crate) struct Tagged {
    pub generation: u64,
    pub input: SessionInput,
}

fn forward<T: Send + 'static>(
    mut events: mpsc::UnboundedReceiver<T>,
    generation: u64,
    inputs: mpsc::UnboundedSender<Tagged>,
    wrap: fn(T) -> SessionInput,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if inputs.send(Tagged::new(generation, wrap(event))).is_err() {
                break;
            }
        }
    })
}

fn spawn_timer(
    duration: Duration,
    generation: u64,
    inputs: mpsc::UnboundedSender<Tagged>,
    input: SessionInput,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        sleep(duration).await;
        let _ = inputs.send(Tagged::new(generation, input));
    })
}

/// Everything one connection attempt owns. Nothing here outlives the session.
pub(crate) struct Session {
    generation: u64,
    room_key: RoomKey,
    identity: String,
    negotiator: Negotiator,
    relay: Option<RelayHandle>,
    transport: Option<Arc<dyn Transport>>,
    ops: Option<mpsc::UnboundedSender<TransportOp>>,
    data: Option<DataSession>,
    tasks: Vec<JoinHandle<()>>,
    timeout: Option<JoinHandle<()>>,
    grace: Option<JoinHandle<()>>,
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.cancel_timers();
    }
}

impl Session {
    pub fn new(generation: u64, room_key: RoomKey, identity: String, role: Role) -> Self {
        Self {
            generation,
            room_key,
            identity,
            negotiator: Negotiator::new(role),
            relay: None,
            transport: None,
            ops: None,
            data: None,
            tasks: vec![],
            timeout: None,
            grace: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> SessionState {
        self.negotiator.state()
    }

    pub fn data(&self) -> Option<&DataSession> {
        self.data.as_ref()
    }

    /// Connects to the relay and creates the transport in the background. The outcome comes back
    /// as [`SessionInput::Attached`].
    pub fn connect(
        &mut self,
        ctx: &Context,
        connector: Arc<dyn RelayConnector>,
        transports: Arc<dyn TransportFactory>,
    ) {
        let result = self.negotiator.start();
        self.absorb(result, ctx);

        let relay_address = ctx.config.relay_address.clone();
        let role = self.negotiator.role();
        let generation = self.generation;
        let inputs = ctx.inputs.clone();
        self.tasks.push(tokio::spawn(async move {
            let result = async {
                let (relay, relay_events) =
                    connector
                        .connect(&relay_address)
                        .await
                        .map_err(|err| match err {
                            RelayError::Refused(reason) => EndReason::RelayRefused(reason),
                            RelayError::LinkDropped(reason) => EndReason::RelayLinkLost(reason),
                        })?;
                let (transport, transport_events) = transports
                    .create(role)
                    .await
                    .map_err(|err| EndReason::Transport(err.to_string()))?;
                Ok::<_, EndReason>(Attached {
                    relay,
                    relay_events,
                    transport,
                    transport_events,
                })
            }
            .await;
            let _ = inputs.send(Tagged::new(generation, SessionInput::Attached(result)));
        }));
    }

    pub fn handle(&mut self, input: SessionInput, ctx: &Context) {
        match input {
            SessionInput::Attached(Ok(attached)) => self.attach(attached, ctx),
            SessionInput::Attached(Err(reason)) => {
                if self.state() != SessionState::AwaitingRelay {
                    return;
                }
                warn!("session {} could not start: {}", self.generation, reason);
                if matches!(reason, EndReason::RelayRefused(_)) {
                    ctx.notice("Failed to connect to signaling server");
                }
                let result = self.negotiator.fail(reason);
                self.absorb(result, ctx);
            }
            SessionInput::Relay(event) => self.on_relay_event(event, ctx),
            SessionInput::Transport(event) => self.on_transport_event(event, ctx),
            SessionInput::Op(outcome) => {
                let result = match outcome {
                    OpOutcome::LocalDescriptionReady(desc) => {
                        self.negotiator.local_description_ready(desc)
                    }
                    OpOutcome::RemoteDescriptionInstalled => {
                        self.negotiator.remote_description_installed()
                    }
                    OpOutcome::Failed { notice, error } => {
                        warn!("transport rejected an operation: {}", error);
                        ctx.notice(notice);
                        self.negotiator.fail(EndReason::Transport(error.to_string()))
                    }
                };
                self.absorb(result, ctx);
            }
            SessionInput::SendFailed(err) => {
                warn!("failed to send message: {}", err);
                ctx.notice("Failed to send message");
            }
            SessionInput::Timeout(state) => {
                let result = self.negotiator.timed_out(state);
                self.absorb(result, ctx);
            }
            SessionInput::GraceExpired => {
                self.grace = None;
                let result = self.negotiator.grace_expired();
                self.absorb(result, ctx);
            }
            SessionInput::TeardownComplete => {
                let result = self.negotiator.teardown_complete();
                self.absorb(result, ctx);
            }
        }
    }

    pub fn close(&mut self, ctx: &Context) {
        let result = self.negotiator.close();
        self.absorb(result, ctx);
    }

    /// Ends the session without waiting for the transport to finish closing.
    pub fn finish(&mut self, ctx: &Context) {
        self.close(ctx);
        let result = self.negotiator.teardown_complete();
        self.absorb(result, ctx);
    }

    fn attach(&mut self, attached: Attached, ctx: &Context) {
        let Attached {
            relay,
            relay_events,
            transport,
            transport_events,
        } = attached;
        if self.state() != SessionState::AwaitingRelay {
            debug!("session {} already left AwaitingRelay", self.generation);
            return;
        }
        let generation = self.generation;
        self.tasks.push(forward(
            relay_events,
            generation,
            ctx.inputs.clone(),
            SessionInput::Relay,
        ));
        self.tasks.push(forward(
            transport_events,
            generation,
            ctx.inputs.clone(),
            SessionInput::Transport,
        ));
        let (ops, worker_task) =
            worker::spawn_op_worker(transport.clone(), generation, ctx.inputs.clone());
        self.tasks.push(worker_task);
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        self.tasks.push(worker::spawn_writer(
            transport.clone(),
            outgoing_rx,
            generation,
            ctx.inputs.clone(),
        ));
        self.data = Some(DataSession::new(self.identity.clone(), outgoing));
        self.ops = Some(ops);
        self.relay = Some(relay);
        self.transport = Some(transport);

        let result = self.negotiator.relay_connected();
        self.absorb(result, ctx);
    }

    fn on_relay_event(&mut self, event: RelayEvent, ctx: &Context) {
        let reason = match event {
            RelayEvent::Envelope(envelope) => return self.on_envelope(envelope, ctx),
            RelayEvent::Error(err) => {
                warn!("relay link error: {}", err);
                match err {
                    RelayError::Refused(reason) => EndReason::RelayRefused(reason),
                    RelayError::LinkDropped(reason) => EndReason::RelayLinkLost(reason),
                }
            }
            RelayEvent::Closed => EndReason::RelayLinkLost("closed by relay".to_owned()),
        };
        let state = self.negotiator.state();
        if state == SessionState::Closing || state.is_terminal() {
            return;
        }
        ctx.notice("Signaling server disconnected");
        let result = self.negotiator.relay_failed(reason);
        self.absorb(result, ctx);
    }

    fn on_envelope(&mut self, envelope: Envelope, ctx: &Context) {
        let (_, sender, payload) = envelope.into_parts();
        let result = match payload {
            Payload::PeerJoined { role } => self.negotiator.peer_joined(role),
            Payload::Description(desc) => {
                let kind = desc.kind;
                let result = self.negotiator.remote_description(desc);
                if result.is_ok() && self.negotiator.state() == SessionState::Negotiating {
                    match kind {
                        SdpKind::Offer => ctx.notice(format!(
                            "Connection offer received from {}",
                            sender.as_deref().unwrap_or("unknown")
                        )),
                        SdpKind::Answer => ctx.notice("Connection answer received"),
                    }
                }
                result
            }
            Payload::Candidate(candidate) => self.negotiator.remote_candidate(candidate),
            Payload::Error { message } => {
                ctx.notice(format!("Error: {}", message));
                self.negotiator.relay_failed(EndReason::RelayReported(message))
            }
            Payload::Join { .. } => {
                trace!("ignoring join from the relay");
                return;
            }
        };
        self.absorb(result, ctx);
    }

    fn on_transport_event(&mut self, event: TransportEvent, ctx: &Context) {
        let result = match event {
            TransportEvent::LocalCandidate(candidate) => self.negotiator.local_candidate(candidate),
            TransportEvent::ConnectionStatus(status) => self.negotiator.transport_status(status),
            TransportEvent::ChannelOpen => self.negotiator.channel_open(),
            TransportEvent::ChannelMessage(data) => {
                if self.negotiator.state() != SessionState::Connected {
                    debug!("dropping payload received in {:?}", self.negotiator.state());
                    return;
                }
                if let Some(data_session) = &self.data {
                    ctx.emit(SessionEvent::MessageReceived(data_session.receive(&data)));
                }
                return;
            }
            TransportEvent::ChannelClosed => {
                if self.negotiator.state() == SessionState::Connected {
                    ctx.notice("Message channel closed");
                }
                self.negotiator.channel_closed()
            }
            TransportEvent::ChannelError(err) => {
                warn!("data channel error: {}", err);
                if !self.negotiator.state().is_terminal() {
                    ctx.notice("Error in message channel");
                }
                self.negotiator.channel_error(err)
            }
        };
        self.absorb(result, ctx);
    }

    /// Applies the negotiator's verdict. Malformed remote input ends the session; any other
    /// rejection is logged and dropped.
    fn absorb(&mut self, result: Actions, ctx: &Context) {
        let actions = match result {
            Ok(actions) => actions,
            Err(err) if err.is_fatal() => {
                warn!("protocol violation: {}", err);
                match self
                    .negotiator
                    .fail(EndReason::ProtocolViolation(err.to_string()))
                {
                    Ok(actions) => actions,
                    Err(err) => {
                        error!("failed to fail session {}: {}", self.generation, err);
                        return;
                    }
                }
            }
            Err(err) => {
                debug!("rejected input: {}", err);
                return;
            }
        };
        for action in actions {
            self.apply(action, ctx);
        }
    }

    fn apply(&mut self, action: Action, ctx: &Context) {
        match action {
            Action::StateChanged { to, reason, .. } => {
                ctx.emit(SessionEvent::StateChanged {
                    state: to,
                    reason: reason.clone(),
                });
                self.entered(to, reason, ctx);
            }
            Action::Join => {
                if let Some(relay) = &self.relay {
                    relay.join(&self.room_key, &self.identity, self.negotiator.role());
                }
            }
            Action::CreateChannel => self.request(TransportOp::CreateChannel),
            Action::CreateLocalDescription(kind) => {
                self.request(TransportOp::CreateLocalDescription(kind))
            }
            Action::SetRemoteDescription(desc) => {
                self.request(TransportOp::SetRemoteDescription(desc))
            }
            Action::AddRemoteCandidate(candidate) => {
                self.request(TransportOp::AddRemoteCandidate(candidate))
            }
            Action::SendDescription(desc) => {
                if let Some(relay) = &self.relay {
                    relay.send(Envelope::description(
                        self.room_key.clone(),
                        self.identity.clone(),
                        desc,
                    ));
                }
            }
            Action::SendCandidate(candidate) => {
                if let Some(relay) = &self.relay {
                    relay.send(Envelope::candidate(
                        self.room_key.clone(),
                        self.identity.clone(),
                        candidate,
                    ));
                }
            }
            Action::OpenDataSession => {
                if self.data.as_mut().is_some_and(|data| data.open()) {
                    ctx.notice("Ready to send messages!");
                }
            }
            Action::StartGraceTimer => {
                if let Some(grace) = self.grace.take() {
                    grace.abort();
                }
                self.grace = Some(spawn_timer(
                    ctx.config.grace_period,
                    self.generation,
                    ctx.inputs.clone(),
                    SessionInput::GraceExpired,
                ));
            }
            Action::Notice(text) => ctx.notice(text),
            Action::Teardown => self.teardown(ctx),
        }
    }

    fn request(&self, op: TransportOp) {
        let Some(ops) = &self.ops else {
            debug!("no transport for {:?}", op);
            return;
        };
        if ops.send(op).is_err() {
            debug!("transport worker is gone");
        }
    }

    fn entered(&mut self, state: SessionState, reason: Option<EndReason>, ctx: &Context) {
        match state {
            SessionState::AwaitingPeer => {
                info!("joined room {}", self.room_key);
                ctx.notice("Connected to signaling server");
                let (local, remote) = match self.negotiator.role() {
                    Role::Initiator => ("Connecting...".to_owned(), self.room_key.to_string()),
                    Role::Responder => (
                        format!("Waiting on room: {}", self.room_key),
                        "Waiting for sender...".to_owned(),
                    ),
                };
                ctx.emit(SessionEvent::Addresses { local, remote });
                self.arm_timeout(state, ctx);
            }
            SessionState::Negotiating => {
                if self.negotiator.role() == Role::Initiator {
                    ctx.notice("Receiver found, establishing connection...");
                }
                self.arm_timeout(state, ctx);
            }
            SessionState::Connected => {
                info!("session {} connected", self.generation);
                self.cancel_timers();
                ctx.notice("P2P connection established successfully!");
            }
            SessionState::Closed => {
                info!("session {} closed", self.generation);
                self.cancel_timers();
                ctx.emit(SessionEvent::not_connected());
                ctx.notice("Disconnected");
            }
            SessionState::Failed => {
                self.cancel_timers();
                ctx.emit(SessionEvent::not_connected());
                match reason {
                    Some(EndReason::Disconnected) => {
                        info!("session {} ended before connecting", self.generation);
                        ctx.notice("Disconnected");
                    }
                    Some(reason) => {
                        warn!("session {} failed: {}", self.generation, reason);
                        ctx.notice("Connection failed. Please try again.");
                    }
                    None => {
                        warn!("session {} failed", self.generation);
                        ctx.notice("Connection failed. Please try again.");
                    }
                }
            }
            SessionState::Idle | SessionState::AwaitingRelay | SessionState::Closing => {}
        }
    }

    fn arm_timeout(&mut self, state: SessionState, ctx: &Context) {
        if let Some(timeout) = self.timeout.take() {
            timeout.abort();
        }
        let duration = match state {
            SessionState::AwaitingPeer => ctx.config.peer_timeout,
            SessionState::Negotiating => ctx.config.negotiation_timeout,
            _ => None,
        };
        let Some(duration) = duration else {
            return;
        };
        self.timeout = Some(spawn_timer(
            duration,
            self.generation,
            ctx.inputs.clone(),
            SessionInput::Timeout(state),
        ));
    }

    fn cancel_timers(&mut self) {
        for timer in [self.timeout.take(), self.grace.take()].into_iter().flatten() {
            timer.abort();
        }
    }

    fn teardown(&mut self, ctx: &Context) {
        debug!("tearing down session {}", self.generation);
        if let Some(data) = &mut self.data {
            data.close();
        }
        self.cancel_timers();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.ops = None;
        if let Some(mut relay) = self.relay.take() {
            relay.close();
        }
        let generation = self.generation;
        let inputs = ctx.inputs.clone();
        match self.transport.take() {
            Some(transport) => {
                tokio::spawn(async move {
                    if let Err(err) = transport.close().await {
                        debug!("transport close: {}", err);
                    }
                    let _ = inputs.send(Tagged::new(generation, SessionInput::TeardownComplete));
                });
            }
            None => {
                let _ = inputs.send(Tagged::new(generation, SessionInput::TeardownComplete));
            }
        }
    }
}
