pub mod peer_connection;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    address::Role,
    signaling::{Candidate, SessionDescription},
};

pub use peer_connection::{PeerConnectionFactory, PeerConnectionTransport};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionStatus {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug)]
pub enum TransportEvent {
    LocalCandidate(Candidate),
    ConnectionStatus(ConnectionStatus),
    ChannelOpen,
    ChannelMessage(Bytes),
    ChannelClosed,
    ChannelError(String),
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum TransportError {
    #[error("{0}")]
    Rejected(String),
    #[error("data channel is not available")]
    NoChannel,
    #[error("transport is closed")]
    Closed,
}

impl From<webrtc::Error> for TransportError {
    fn from(err: webrtc::Error) -> Self {
        match err {
            webrtc::Error::ErrConnectionClosed | webrtc::Error::ErrClosedPipe => Self::Closed,
            err => Self::Rejected(err.to_string()),
        }
    }
}

/// The peer-to-peer transport as seen by the negotiation core.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the ordered data channel. Only the initiator calls this; the responder's channel
    /// arrives as a side effect of accepting the offer.
    async fn create_channel(&self) -> Result<(), TransportError>;
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;
    async fn add_remote_candidate(&self, candidate: Candidate) -> Result<(), TransportError>;
    async fn send(&self, data: Bytes) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        role: Role,
    ) -> Result<(Arc<dyn Transport>, TransportEvents), TransportError>;
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_owned()],
            username: None,
            credential: None,
        }
    }

    pub fn defaults() -> Vec<Self> {
        vec![
            Self::stun("stun:stun.l.google.com:19302"),
            Self::stun("stun:stun1.l.google.com:19302"),
            Self::stun("stun:stun2.l.google.com:19302"),
        ]
    }
}
