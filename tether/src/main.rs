mod config;
mod cui;
mod tracing_helper;

use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tether_lib::{
    relay::WebSocketConnector, transport::PeerConnectionFactory, Role, SessionController,
};
use tracing::info;

use crate::{config::Config, cui::Cui};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Sender,
    Receiver,
}

impl From<Mode> for Role {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Sender => Role::Initiator,
            Mode::Receiver => Role::Responder,
        }
    }
}

/// Peer-to-peer chat negotiated over a WebSocket relay.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// TOML settings file
    #[arg(long, default_value = "tether.toml")]
    config: PathBuf,
    /// Relay URL, e.g. ws://127.0.0.1:9000
    #[arg(long)]
    relay: Option<String>,
    /// Display name
    #[arg(long)]
    name: Option<String>,
    #[arg(long, value_enum)]
    mode: Option<Mode>,
    /// Receiver's IP:PORT as sender, room to wait in as receiver
    #[arg(long)]
    address: Option<String>,
    /// Connect right away instead of waiting for /connect
    #[arg(long)]
    connect: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(relay) = &self.relay {
            config.relay_url = relay.clone();
        }
        if let Some(name) = &self.name {
            config.name = Some(name.clone());
        }
        if let Some(mode) = self.mode {
            config.role = mode.into();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = config::load(&args.config).await?;
    args.apply(&mut config);

    tracing_helper::init_tracing(
        &config.log_dir,
        concat!(env!("CARGO_PKG_NAME"), ".log"),
        true,
    )?;
    info!("relay: {}", config.relay_url);

    let (controller, events) = SessionController::new(
        config.controller_config(),
        Arc::new(WebSocketConnector::default()),
        Arc::new(PeerConnectionFactory::new(config.ice_servers.clone())),
    );
    let handle = controller.spawn();
    Cui::new(handle, config.role, config.name, args.address)
        .run(events, args.connect)
        .await
}
