use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};
use webrtc::{
    api::{setting_engine::SettingEngine, APIBuilder},
    data_channel::{
        data_channel_init::RTCDataChannelInit, data_channel_message::DataChannelMessage,
        RTCDataChannel,
    },
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_server::RTCIceServer,
    },
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

use crate::{
    address::Role,
    signaling::{Candidate, SdpKind, SessionDescription},
};

use super::{
    ConnectionStatus, IceServer, Transport, TransportError, TransportEvent, TransportEvents,
    TransportFactory,
};

const CHANNEL_LABEL: &str = "chat";

fn create_config(ice_servers: &[IceServer]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

async fn create_peer_connection(
    ice_servers: &[IceServer],
) -> Result<RTCPeerConnection, TransportError> {
    let mut setting_engine = SettingEngine::default();
    setting_engine.set_ice_timeouts(None, Some(Duration::from_secs(30)), None);
    Ok(APIBuilder::new()
        .with_setting_engine(setting_engine)
        .build()
        .new_peer_connection(create_config(ice_servers))
        .await?)
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    Ok(match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    })
}

fn to_status(state: RTCPeerConnectionState) -> Option<ConnectionStatus> {
    Some(match state {
        RTCPeerConnectionState::New => ConnectionStatus::New,
        RTCPeerConnectionState::Connecting => ConnectionStatus::Connecting,
        RTCPeerConnectionState::Connected => ConnectionStatus::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionStatus::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionStatus::Failed,
        RTCPeerConnectionState::Closed => ConnectionStatus::Closed,
        RTCPeerConnectionState::Unspecified => return None,
    })
}

fn attach_channel(rtc: &RTCDataChannel, events: &mpsc::UnboundedSender<TransportEvent>) {
    let tx = events.clone();
    rtc.on_open(Box::new(move || {
        debug!("data channel opened");
        let _ = tx.send(TransportEvent::ChannelOpen);
        Box::pin(async {})
    }));
    let tx = events.clone();
    rtc.on_message(Box::new(move |msg: DataChannelMessage| {
        let _ = tx.send(TransportEvent::ChannelMessage(msg.data));
        Box::pin(async {})
    }));
    let tx = events.clone();
    rtc.on_error(Box::new(move |err| {
        warn!("data channel error: {}", err);
        let _ = tx.send(TransportEvent::ChannelError(err.to_string()));
        Box::pin(async {})
    }));
    let tx = events.clone();
    rtc.on_close(Box::new(move || {
        debug!("data channel closed");
        let _ = tx.send(TransportEvent::ChannelClosed);
        Box::pin(async {})
    }));
}

pub struct PeerConnectionTransport {
    rtc: Arc<RTCPeerConnection>,
    data_channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Drop for PeerConnectionTransport {
    fn drop(&mut self) {
        trace!("drop peer connection");
        let rtc = self.rtc.clone();
        // NOTE: An established connection is not torn down by dropping it, so close it explicitly.
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                let _ = rtc.close().await;
                trace!("peer connection closed");
            });
        }
    }
}

impl PeerConnectionTransport {
    async fn new(
        ice_servers: &[IceServer],
        role: Role,
    ) -> Result<(Self, TransportEvents), TransportError> {
        let rtc = Arc::new(create_peer_connection(ice_servers).await?);
        let (events, events_rx) = mpsc::unbounded_channel();

        let tx = events.clone();
        rtc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    trace!("candidate gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::LocalCandidate(Candidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => warn!("failed to serialize local candidate: {}", err),
                }
            })
        }));

        let tx = events.clone();
        rtc.on_peer_connection_state_change(Box::new(move |state| {
            debug!("on_peer_connection_state_change {}", state);
            if let Some(status) = to_status(state) {
                let _ = tx.send(TransportEvent::ConnectionStatus(status));
            }
            Box::pin(async {})
        }));

        let data_channel = Arc::new(Mutex::new(None));
        if role == Role::Responder {
            let tx = events.clone();
            let slot = data_channel.clone();
            rtc.on_data_channel(Box::new(move |rtc_data_channel: Arc<RTCDataChannel>| {
                debug!("data channel received: {}", rtc_data_channel.label());
                attach_channel(&rtc_data_channel, &tx);
                let slot = slot.clone();
                Box::pin(async move {
                    *slot.lock().await = Some(rtc_data_channel);
                })
            }));
        }

        Ok((
            Self {
                rtc,
                data_channel,
                events,
            },
            events_rx,
        ))
    }
}

#[async_trait]
impl Transport for PeerConnectionTransport {
    async fn create_channel(&self) -> Result<(), TransportError> {
        let rtc_data_channel = self
            .rtc
            .create_data_channel(
                CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        attach_channel(&rtc_data_channel, &self.events);
        *self.data_channel.lock().await = Some(rtc_data_channel);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.rtc.create_offer(None).await?;
        Ok(SessionDescription::new(SdpKind::Offer, offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.rtc.create_answer(None).await?;
        Ok(SessionDescription::new(SdpKind::Answer, answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.rtc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.rtc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: Candidate) -> Result<(), TransportError> {
        self.rtc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        let rtc_data_channel = self
            .data_channel
            .lock()
            .await
            .clone()
            .ok_or(TransportError::NoChannel)?;
        // Text frames keep browser peers able to JSON.parse the payload.
        match std::str::from_utf8(&data) {
            Ok(text) => rtc_data_channel.send_text(text.to_owned()).await?,
            Err(_) => rtc_data_channel.send(&data).await?,
        };
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(rtc_data_channel) = self.data_channel.lock().await.take() {
            let _ = rtc_data_channel.close().await;
        }
        self.rtc.close().await?;
        Ok(())
    }
}

/// Creates one WebRTC peer connection per session.
#[derive(Clone, Debug)]
pub struct PeerConnectionFactory {
    ice_servers: Vec<IceServer>,
}

impl PeerConnectionFactory {
    pub fn new(ice_servers: Vec<IceServer>) -> Self {
        Self { ice_servers }
    }
}

impl Default for PeerConnectionFactory {
    fn default() -> Self {
        Self::new(IceServer::defaults())
    }
}

#[async_trait]
impl TransportFactory for PeerConnectionFactory {
    async fn create(
        &self,
        role: Role,
    ) -> Result<(Arc<dyn Transport>, TransportEvents), TransportError> {
        let (transport, events) = PeerConnectionTransport::new(&self.ice_servers, role).await?;
        Ok((Arc::new(transport), events))
    }
}
