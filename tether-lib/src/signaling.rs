pub mod wire;

use derive_new::new;
use getset::Getters;
use serde::{Deserialize, Serialize};

use crate::address::{Role, RoomKey};

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description in the shape browsers put on the wire: `{ "type": "offer", "sdp": .. }`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, new)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn validate(&self) -> Result<(), String> {
        if !self.sdp.trim_start().starts_with("v=") {
            return Err(format!("{:?} does not contain an SDP body", self.kind));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl Candidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_owned()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    /// Browsers signal the end of gathering with an empty candidate line.
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.candidate.contains("candidate:") {
            return Err(format!("not a candidate line: {}", self.candidate));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnvelopeKind {
    Join,
    PeerJoined,
    Description,
    Candidate,
    Error,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Payload {
    Join { role: Role },
    PeerJoined { role: Option<Role> },
    Description(SessionDescription),
    Candidate(Candidate),
    Error { message: String },
}

/// The unit routed by the relay. The relay only looks at `room`; the payload is opaque to it.
#[derive(Clone, Debug, Eq, Getters, PartialEq, new)]
pub struct Envelope {
    #[get = "pub"]
    room: Option<RoomKey>,
    #[get = "pub"]
    sender: Option<String>,
    #[get = "pub"]
    payload: Payload,
}

impl Envelope {
    pub fn join(room: RoomKey, identity: String, role: Role) -> Self {
        Self::new(Some(room), Some(identity), Payload::Join { role })
    }

    pub fn peer_joined(room: RoomKey, identity: Option<String>, role: Option<Role>) -> Self {
        Self::new(Some(room), identity, Payload::PeerJoined { role })
    }

    pub fn description(room: RoomKey, identity: String, desc: SessionDescription) -> Self {
        Self::new(Some(room), Some(identity), Payload::Description(desc))
    }

    pub fn candidate(room: RoomKey, identity: String, candidate: Candidate) -> Self {
        Self::new(Some(room), Some(identity), Payload::Candidate(candidate))
    }

    pub fn error(room: Option<RoomKey>, message: String) -> Self {
        Self::new(room, None, Payload::Error { message })
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self.payload {
            Payload::Join { .. } => EnvelopeKind::Join,
            Payload::PeerJoined { .. } => EnvelopeKind::PeerJoined,
            Payload::Description(_) => EnvelopeKind::Description,
            Payload::Candidate(_) => EnvelopeKind::Candidate,
            Payload::Error { .. } => EnvelopeKind::Error,
        }
    }

    pub fn into_parts(self) -> (Option<RoomKey>, Option<String>, Payload) {
        (self.room, self.sender, self.payload)
    }
}
