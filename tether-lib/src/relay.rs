pub mod channel;
pub mod websocket;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, trace};

use crate::{
    address::{Role, RoomKey},
    signaling::Envelope,
};

pub use channel::{ChannelConnector, RelayLink};
pub use websocket::WebSocketConnector;

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum RelayError {
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("relay link dropped: {0}")]
    LinkDropped(String),
}

#[derive(Debug)]
pub enum RelayEvent {
    Envelope(Envelope),
    /// The link failed (refused mid-handshake, reset, protocol error).
    Error(RelayError),
    /// The relay closed the link in an orderly way.
    Closed,
}

/// Inbound side of a relay link. Events arrive in relay-delivery order.
pub type RelayEvents = mpsc::UnboundedReceiver<RelayEvent>;

#[async_trait]
pub trait RelayConnector: Send + Sync {
    /// Resolves once the relay accepted the control connection.
    async fn connect(&self, relay_address: &str) -> Result<(RelayHandle, RelayEvents), RelayError>;
}

/// Outbound side of a relay link, exclusively owned by one session.
///
/// Sends are fire-and-forget. Nothing is retried and nothing reconnects.
pub struct RelayHandle {
    outgoing: Option<mpsc::UnboundedSender<Envelope>>,
    open: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayHandle {
    pub fn new(
        outgoing: mpsc::UnboundedSender<Envelope>,
        open: Arc<AtomicBool>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            outgoing: Some(outgoing),
            open,
            tasks,
        }
    }

    pub fn is_open(&self) -> bool {
        self.outgoing.is_some() && self.open.load(Ordering::Acquire)
    }

    pub fn join(&self, room: &RoomKey, identity: &str, role: Role) {
        self.send(Envelope::join(room.clone(), identity.to_owned(), role));
    }

    pub fn send(&self, envelope: Envelope) {
        if !self.is_open() {
            debug!("relay link is not open, dropping {:?}", envelope.kind());
            return;
        }
        let Some(outgoing) = &self.outgoing else {
            return;
        };
        trace!("relay send {:?}", envelope.kind());
        if outgoing.send(envelope).is_err() {
            debug!("relay writer is gone");
        }
    }

    pub fn close(&mut self) {
        if self.outgoing.take().is_none() {
            return;
        }
        self.open.store(false, Ordering::Release);
        for task in self.tasks.drain(..) {
            task.abort();
        }
        trace!("relay handle closed");
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.close();
    }
}
