use std::io::{self, Write};

use anyhow::{Context, Result};
use tether_lib::{
    data_session::InboundMessage, CommandError, ControllerHandle, EndReason, Role, SessionEvent,
    SessionState,
};
use time::OffsetDateTime;
use tokio::{
    io::{stdin, AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::{debug, warn};

#[derive(Debug, PartialEq)]
enum Input {
    Connect(Option<String>),
    Disconnect,
    Switch,
    Name(String),
    Help,
    Quit,
    Message(String),
    Unknown(String),
    Empty,
}

impl Input {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Self::Message(line.to_owned());
        };
        let (command, arg) = match command.split_once(char::is_whitespace) {
            Some((command, arg)) => (command, Some(arg.trim().to_owned())),
            None => (command, None),
        };
        match (command, arg) {
            ("connect" | "c", arg) => Self::Connect(arg),
            ("disconnect" | "d", None) => Self::Disconnect,
            ("switch" | "s", None) => Self::Switch,
            ("name", Some(name)) => Self::Name(name),
            ("help" | "h", None) => Self::Help,
            ("quit" | "q" | "exit", None) => Self::Quit,
            _ => Self::Unknown(line.to_owned()),
        }
    }
}

fn print_help(role: Role) {
    println!();
    println!("  /connect [address]  connect as {} ({})", role, address_hint(role));
    println!("  /disconnect         end the current session");
    println!("  /switch             switch between sender and receiver mode");
    println!("  /name <name>        set your display name");
    println!("  /quit               exit");
    println!("  anything else is sent as a message");
    println!();
}

fn address_hint(role: Role) -> &'static str {
    match role {
        Role::Initiator => "IP:PORT of the receiver's room",
        Role::Responder => "optional room, generated when omitted",
    }
}

fn clock(timestamp: OffsetDateTime) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        timestamp.hour(),
        timestamp.minute(),
        timestamp.second()
    )
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged { state, reason } => match (state, reason) {
            (SessionState::Failed, Some(reason)) if *reason != EndReason::Disconnected => {
                println!("* state: Failed ({})", reason)
            }
            (state, _) => debug!("state: {:?}", state),
        },
        SessionEvent::MessageReceived(InboundMessage::Structured(msg)) => {
            println!("[{}] {}: {}", clock(msg.timestamp), msg.sender, msg.content);
        }
        SessionEvent::MessageReceived(InboundMessage::Raw {
            content,
            received_at,
        }) => {
            println!("[{}] peer: {}", clock(*received_at), content);
        }
        SessionEvent::MessageSent(msg) => {
            println!("[{}] you: {}", clock(msg.timestamp), msg.content);
        }
        SessionEvent::Notice(text) => println!("* {}", text),
        SessionEvent::Addresses { local, remote } => {
            println!("* local: {} / remote: {}", local, remote);
        }
        SessionEvent::RoleChanged(_) => {}
    }
}

fn prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}

pub struct Cui {
    handle: ControllerHandle,
    role: Role,
    name: Option<String>,
    address: Option<String>,
}

impl Cui {
    pub fn new(
        handle: ControllerHandle,
        role: Role,
        name: Option<String>,
        address: Option<String>,
    ) -> Self {
        Self {
            handle,
            role,
            name,
            address,
        }
    }

    async fn connect(&mut self, address: Option<String>) -> Result<()> {
        if address.is_some() {
            self.address = address;
        }
        let Some(name) = self.name.clone() else {
            println!("* Please enter your name with /name <name>");
            return Ok(());
        };
        let address = self.address.clone().unwrap_or_default();
        match self.handle.start_session(self.role, &address, &name).await {
            Ok(()) => Ok(()),
            Err(CommandError::Validation(err)) => {
                println!("* {}", capitalize(&err.to_string()));
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn execute(&mut self, input: Input) -> Result<bool> {
        match input {
            Input::Empty => {}
            Input::Connect(address) => self.connect(address).await?,
            Input::Disconnect => self.handle.end_session()?,
            Input::Switch => {
                self.role = self.handle.switch_role().await?;
                self.address = None;
                print_help(self.role);
            }
            Input::Name(name) => {
                println!("* Name set to {}", name);
                self.name = Some(name);
            }
            Input::Help => print_help(self.role),
            Input::Quit => return Ok(false),
            Input::Message(text) => match self.handle.send_message(&text).await {
                Ok(_) | Err(CommandError::DataSession(_)) => {}
                Err(err) => return Err(err.into()),
            },
            Input::Unknown(line) => println!("* Unknown command: {}", line),
        }
        Ok(true)
    }

    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
        connect_now: bool,
    ) -> Result<()> {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        print_help(self.role);
        if connect_now {
            self.connect(None).await?;
        }
        prompt();
        let mut lines = BufReader::new(stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.context("failed to read stdin")? else {
                        break;
                    };
                    if !self.execute(Input::parse(&line)).await? {
                        break;
                    }
                    prompt();
                }
                Some(event) = events.recv() => print_event(&event),
            }
        }
        if let Err(err) = self.handle.end_session() {
            warn!("{}", err);
        }
        Ok(())
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
