mod session;
mod worker;

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

use crate::{
    address::{resolve, Role, ValidationError},
    data_session::{ChatMessage, DataSessionError, InboundMessage},
    negotiation::{EndReason, SessionState},
    relay::RelayConnector,
    transport::TransportFactory,
};

use self::session::{Session, Tagged};

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub relay_address: String,
    /// Fails a session that waits longer than this for a peer.
    pub peer_timeout: Option<Duration>,
    /// Fails a session whose negotiation does not reach Connected in time.
    pub negotiation_timeout: Option<Duration>,
    /// How long a connected transport may stay disconnected before the session is dropped.
    pub grace_period: Duration,
}

impl ControllerConfig {
    pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

    pub fn new(relay_address: impl Into<String>) -> Self {
        Self {
            relay_address: relay_address.into(),
            peer_timeout: None,
            negotiation_timeout: None,
            grace_period: Self::DEFAULT_GRACE_PERIOD,
        }
    }
}

/// Everything the presentation layer gets to see.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        state: SessionState,
        reason: Option<EndReason>,
    },
    MessageReceived(InboundMessage),
    MessageSent(ChatMessage),
    Notice(String),
    Addresses {
        local: String,
        remote: String,
    },
    RoleChanged(Role),
}

impl SessionEvent {
    fn not_connected() -> Self {
        Self::Addresses {
            local: "Not connected".to_owned(),
            remote: "Not connected".to_owned(),
        }
    }
}

pub(crate) struct Context {
    config: ControllerConfig,
    events: mpsc::UnboundedSender<SessionEvent>,
    inputs: mpsc::UnboundedSender<Tagged>,
}

impl Context {
    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            trace!("no event subscriber");
        }
    }

    fn notice(&self, text: impl Into<String>) {
        let text = text.into();
        debug!("notice: {}", text);
        self.emit(SessionEvent::Notice(text));
    }
}

/// Owns at most one session and routes every async continuation back to it. Continuations of a
/// replaced session carry an old generation and are dropped.
pub struct SessionController {
    ctx: Context,
    inputs: mpsc::UnboundedReceiver<Tagged>,
    connector: Arc<dyn RelayConnector>,
    transports: Arc<dyn TransportFactory>,
    role: Role,
    last_generation: u64,
    session: Option<Session>,
}

impl SessionController {
    pub fn new(
        config: ControllerConfig,
        connector: Arc<dyn RelayConnector>,
        transports: Arc<dyn TransportFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        (
            Self {
                ctx: Context {
                    config,
                    events: events_tx,
                    inputs: inputs_tx,
                },
                inputs: inputs_rx,
                connector,
                transports,
                role: Role::Initiator,
                last_generation: 0,
                session: None,
            },
            events_rx,
        )
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map_or(SessionState::Idle, |session| session.state())
    }

    /// Validates the input and starts connecting. Nothing touches the network if validation
    /// fails. A session that is still active is ended first.
    pub fn start_session(
        &mut self,
        role: Role,
        address: &str,
        identity: &str,
    ) -> Result<(), ValidationError> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(ValidationError::MissingField("name"));
        }
        let resolution = resolve(address, role)?;

        self.finish_session();
        self.role = role;
        self.last_generation += 1;
        info!(
            "starting session {} as {} in room {}",
            self.last_generation,
            role,
            resolution.room_key()
        );
        let mut session = Session::new(
            self.last_generation,
            resolution.into_room_key(),
            identity.to_owned(),
            role,
        );
        self.ctx.notice(format!("Connecting as {}...", role));
        session.connect(&self.ctx, self.connector.clone(), self.transports.clone());
        self.session = Some(session);
        Ok(())
    }

    pub fn end_session(&mut self) {
        if let Some(session) = &mut self.session {
            session.close(&self.ctx);
        }
    }

    pub fn send_message(&mut self, text: &str) -> Result<ChatMessage, DataSessionError> {
        let result = self
            .session
            .as_ref()
            .and_then(|session| session.data())
            .ok_or(DataSessionError::NotReady)
            .and_then(|data| data.send(text));
        match &result {
            Ok(msg) => self.ctx.emit(SessionEvent::MessageSent(msg.clone())),
            Err(DataSessionError::NotReady) => {
                self.ctx
                    .notice("Connection not ready. Please wait or reconnect.");
            }
            Err(_) => self.ctx.notice("Failed to send message"),
        }
        result
    }

    /// Ends any active session and flips the role used by the next one.
    pub fn switch_role(&mut self) -> Role {
        self.finish_session();
        self.session = None;
        self.role = self.role.toggled();
        info!("switched to {}", self.role);
        self.ctx.emit(SessionEvent::RoleChanged(self.role));
        self.ctx
            .notice(format!("Switched to {} mode", self.role.mode_name()));
        self.role
    }

    fn finish_session(&mut self) {
        if let Some(session) = &mut self.session {
            session.finish(&self.ctx);
        }
    }

    /// Waits for the next async continuation and applies it.
    pub async fn step(&mut self) {
        if let Some(tagged) = self.inputs.recv().await {
            self.handle_input(tagged);
        }
    }

    pub(crate) fn handle_input(&mut self, tagged: Tagged) {
        let Some(session) = self
            .session
            .as_mut()
            .filter(|session| session.generation() == tagged.generation)
        else {
            trace!("dropping input of stale session {}", tagged.generation);
            return;
        };
        session.handle(tagged.input, &self.ctx);
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::Start {
                role,
                address,
                identity,
                reply,
            } => {
                let _ = reply.send(self.start_session(role, &address, &identity));
            }
            Command::End => self.end_session(),
            Command::Send { text, reply } => {
                let _ = reply.send(self.send_message(&text));
            }
            Command::SwitchRole { reply } => {
                let _ = reply.send(self.switch_role());
            }
        }
    }

    /// Runs until every [`ControllerHandle`] is dropped.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    self.execute(command);
                }
                Some(tagged) = self.inputs.recv() => self.handle_input(tagged),
            }
        }
        debug!("controller stopped");
        self.finish_session();
    }

    pub fn spawn(self) -> ControllerHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        tokio::spawn(self.run(commands_rx));
        ControllerHandle {
            commands: commands_tx,
        }
    }
}

pub enum Command {
    Start {
        role: Role,
        address: String,
        identity: String,
        reply: oneshot::Sender<Result<(), ValidationError>>,
    },
    End,
    Send {
        text: String,
        reply: oneshot::Sender<Result<ChatMessage, DataSessionError>>,
    },
    SwitchRole {
        reply: oneshot::Sender<Role>,
    },
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    DataSession(#[from] DataSessionError),
    #[error("session controller has stopped")]
    Stopped,
}

/// Cloneable front of a spawned [`SessionController`].
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ControllerHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CommandError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .map_err(|_| CommandError::Stopped)?;
        reply_rx.await.map_err(|_| CommandError::Stopped)
    }

    pub async fn start_session(
        &self,
        role: Role,
        address: &str,
        identity: &str,
    ) -> Result<(), CommandError> {
        let (address, identity) = (address.to_owned(), identity.to_owned());
        Ok(self
            .request(|reply| Command::Start {
                role,
                address,
                identity,
                reply,
            })
            .await??)
    }

    pub fn end_session(&self) -> Result<(), CommandError> {
        self.commands
            .send(Command::End)
            .map_err(|_| CommandError::Stopped)
    }

    pub async fn send_message(&self, text: &str) -> Result<ChatMessage, CommandError> {
        let text = text.to_owned();
        Ok(self
            .request(|reply| Command::Send { text, reply })
            .await??)
    }

    pub async fn switch_role(&self) -> Result<Role, CommandError> {
        self.request(|reply| Command::SwitchRole { reply }).await
    }
}
