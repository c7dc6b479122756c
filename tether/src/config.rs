use std::{io::ErrorKind, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;
use tether_lib::{transport::IceServer, ControllerConfig, Role};
use tokio::fs::read_to_string;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:9000";

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub relay_url: String,
    pub name: Option<String>,
    pub role: Role,
    pub ice_servers: Vec<IceServer>,
    pub peer_timeout_sec: Option<u64>,
    pub negotiation_timeout_sec: Option<u64>,
    pub grace_period_sec: u64,
    pub log_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_owned(),
            name: None,
            role: Role::Initiator,
            ice_servers: IceServer::defaults(),
            peer_timeout_sec: None,
            negotiation_timeout_sec: None,
            grace_period_sec: ControllerConfig::DEFAULT_GRACE_PERIOD.as_secs(),
            log_dir: ".".to_owned(),
        }
    }
}

impl Config {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            peer_timeout: self.peer_timeout_sec.map(Duration::from_secs),
            negotiation_timeout: self.negotiation_timeout_sec.map(Duration::from_secs),
            grace_period: Duration::from_secs(self.grace_period_sec),
            ..ControllerConfig::new(&self.relay_url)
        }
    }
}

/// A missing file is not an error: every key has a default.
pub async fn load(path: &Path) -> Result<Config> {
    let text = match read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Config::default()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}
