#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tether_lib::{
    relay::{ChannelConnector, RelayLink},
    signaling::{Candidate, Envelope, Payload, SdpKind, SessionDescription},
    transport::{Transport, TransportError, TransportEvent, TransportEvents, TransportFactory},
    ControllerConfig, EndReason, Role, RoomKey, SessionController, SessionEvent, SessionState,
};
use tokio::{
    sync::{mpsc, Semaphore},
    time::timeout,
};

pub const SDP: &str = "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Call {
    CreateChannel,
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddCandidate(String),
    Send(String),
    Close,
}

pub struct StubTransport {
    calls: Arc<Mutex<Vec<Call>>>,
    offers: Arc<Semaphore>,
}

impl StubTransport {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn create_channel(&self) -> Result<(), TransportError> {
        self.record(Call::CreateChannel);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let _permit = self.offers.acquire().await.unwrap();
        self.record(Call::CreateOffer);
        Ok(SessionDescription::new(SdpKind::Offer, SDP.into()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.record(Call::CreateAnswer);
        Ok(SessionDescription::new(SdpKind::Answer, SDP.into()))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.record(Call::SetLocal(desc.kind));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(Call::SetRemote(desc.kind));
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: Candidate) -> Result<(), TransportError> {
        self.record(Call::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        self.record(Call::Send(String::from_utf8_lossy(&data).into_owned()));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.record(Call::Close);
        Ok(())
    }
}

/// The test's view of one transport handed out by [`StubFactory`].
pub struct StubPeer {
    pub role: Role,
    calls: Arc<Mutex<Vec<Call>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl StubPeer {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

pub struct StubFactory {
    peers: mpsc::UnboundedSender<StubPeer>,
    offers: Arc<Semaphore>,
}

#[async_trait]
impl TransportFactory for StubFactory {
    async fn create(
        &self,
        role: Role,
    ) -> Result<(Arc<dyn Transport>, TransportEvents), TransportError> {
        let calls = Arc::new(Mutex::new(vec![]));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = self.peers.send(StubPeer {
            role,
            calls: calls.clone(),
            events: events_tx,
        });
        Ok((
            Arc::new(StubTransport {
                calls,
                offers: self.offers.clone(),
            }),
            events_rx,
        ))
    }
}

pub fn candidate(n: u32) -> Candidate {
    Candidate::new(format!(
        "candidate:{n} 1 udp 2122260223 192.168.1.{n} 5400{n} typ host"
    ))
}

pub fn offer() -> SessionDescription {
    SessionDescription::new(SdpKind::Offer, SDP.into())
}

pub fn answer() -> SessionDescription {
    SessionDescription::new(SdpKind::Answer, SDP.into())
}

pub struct Harness {
    pub controller: SessionController,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub links: mpsc::UnboundedReceiver<RelayLink>,
    pub peers: mpsc::UnboundedReceiver<StubPeer>,
    pub connector: Arc<ChannelConnector>,
    /// Each `create_offer` waits for a permit.
    pub offers: Arc<Semaphore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ControllerConfig::new("mem://relay"))
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        Self::build(config, Semaphore::MAX_PERMITS)
    }

    /// Offers stay in flight until the test adds permits to `offers`.
    pub fn holding_offers() -> Self {
        Self::build(ControllerConfig::new("mem://relay"), 0)
    }

    fn build(config: ControllerConfig, offer_permits: usize) -> Self {
        let offers = Arc::new(Semaphore::new(offer_permits));
        let (connector, links) = ChannelConnector::new();
        let connector = Arc::new(connector);
        let (peers_tx, peers) = mpsc::unbounded_channel();
        let (controller, events) = SessionController::new(
            config,
            connector.clone(),
            Arc::new(StubFactory {
                peers: peers_tx,
                offers: offers.clone(),
            }),
        );
        Self {
            controller,
            events,
            links,
            peers,
            connector,
            offers,
        }
    }

    /// Applies inputs until nothing arrives for a while.
    pub async fn settle(&mut self) {
        while timeout(Duration::from_millis(50), self.controller.step())
            .await
            .is_ok()
        {}
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut events = vec![];
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Starts a session as "alice" and returns the relay link and transport it got.
    pub async fn start(&mut self, role: Role, address: &str) -> (RelayLink, StubPeer) {
        self.controller.start_session(role, address, "alice").unwrap();
        self.settle().await;
        let link = self.links.try_recv().expect("relay link");
        let peer = self.peers.try_recv().expect("transport");
        (link, peer)
    }

    /// An initiator for room `127.0.0.1:8080` whose offer went out.
    pub async fn negotiating_initiator(&mut self) -> (RelayLink, StubPeer) {
        let (mut link, peer) = self.start(Role::Initiator, "127.0.0.1:8080").await;
        link.try_recv().expect("join");
        link.deliver(Envelope::peer_joined(
            room(),
            Some("bob".into()),
            Some(Role::Responder),
        ));
        self.settle().await;
        assert_eq!(self.controller.state(), SessionState::Negotiating);
        let sent = link.try_recv().expect("offer");
        assert!(matches!(sent.payload(), Payload::Description(desc) if desc.kind == SdpKind::Offer));
        (link, peer)
    }

    pub async fn connected_initiator(&mut self) -> (RelayLink, StubPeer) {
        let (link, peer) = self.negotiating_initiator().await;
        link.deliver(Envelope::description(room(), "bob".into(), answer()));
        self.settle().await;
        peer.emit(TransportEvent::ConnectionStatus(
            tether_lib::transport::ConnectionStatus::Connected,
        ));
        peer.emit(TransportEvent::ChannelOpen);
        self.settle().await;
        assert_eq!(self.controller.state(), SessionState::Connected);
        (link, peer)
    }
}

pub fn room() -> RoomKey {
    RoomKey::new("127.0.0.1:8080")
}

pub fn notices(events: &[SessionEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Notice(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

pub fn states(events: &[SessionEvent]) -> Vec<(SessionState, Option<EndReason>)> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::StateChanged { state, reason } => Some((*state, reason.clone())),
            _ => None,
        })
        .collect()
}

pub fn sent_envelopes(link: &mut RelayLink) -> Vec<Envelope> {
    let mut envelopes = vec![];
    while let Some(envelope) = link.try_recv() {
        envelopes.push(envelope);
    }
    envelopes
}
