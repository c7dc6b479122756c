use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::signaling::Envelope;

use super::{RelayConnector, RelayError, RelayEvent, RelayEvents, RelayHandle};

/// Relay links backed by in-process channels. Every successful `connect` hands the far end of
/// the new link to whoever holds the receiver returned by [`ChannelConnector::new`].
pub struct ChannelConnector {
    links: mpsc::UnboundedSender<RelayLink>,
    refusing: AtomicBool,
}

impl ChannelConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RelayLink>) {
        let (links, links_rx) = mpsc::unbounded_channel();
        (
            Self {
                links,
                refusing: AtomicBool::new(false),
            },
            links_rx,
        )
    }

    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::Release);
    }
}

#[async_trait]
impl RelayConnector for ChannelConnector {
    async fn connect(&self, relay_address: &str) -> Result<(RelayHandle, RelayEvents), RelayError> {
        if self.refusing.load(Ordering::Acquire) {
            return Err(RelayError::Refused(relay_address.to_owned()));
        }
        let open = Arc::new(AtomicBool::new(true));
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let link = RelayLink {
            address: relay_address.to_owned(),
            received: outgoing_rx,
            events: event_tx,
            open: open.clone(),
        };
        self.links
            .send(link)
            .map_err(|_| RelayError::Refused(relay_address.to_owned()))?;
        Ok((RelayHandle::new(outgoing_tx, open, vec![]), event_rx))
    }
}

/// The relay's end of an in-process link.
pub struct RelayLink {
    pub address: String,
    received: mpsc::UnboundedReceiver<Envelope>,
    events: mpsc::UnboundedSender<RelayEvent>,
    open: Arc<AtomicBool>,
}

impl RelayLink {
    /// Next envelope the client sent, or `None` once the client closed its handle.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.received.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.received.try_recv().ok()
    }

    /// Delivers an envelope to the client. Returns `false` if the client is gone.
    pub fn deliver(&self, envelope: Envelope) -> bool {
        self.events.send(RelayEvent::Envelope(envelope)).is_ok()
    }

    pub fn close(self) {
        self.open.store(false, Ordering::Release);
        let _ = self.events.send(RelayEvent::Closed);
    }

    pub fn drop_link(self, reason: &str) {
        self.open.store(false, Ordering::Release);
        let _ = self
            .events
            .send(RelayEvent::Error(RelayError::LinkDropped(reason.to_owned())));
    }
}
