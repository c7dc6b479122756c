//! JSON encoding of envelopes as exchanged with the relay.
//!
//! Field names follow the browser clients that share the relay, so a few aliases are accepted on
//! the way in (`targetAddress` for `room`, `receiverName` for `senderName`, `peer-found` for
//! `user-joined`, and the structured `signal` message).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::{Role, RoomKey};

use super::{Candidate, Envelope, Payload, SdpKind, SessionDescription};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("undecodable relay message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("'{0}' message carries a {1:?} description")]
    KindMismatch(&'static str, SdpKind),
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireMessage {
    Join {
        room: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<Role>,
        #[serde(
            default,
            rename = "targetAddress",
            skip_serializing_if = "Option::is_none"
        )]
        target_address: Option<String>,
    },
    #[serde(alias = "peer-found")]
    UserJoined {
        #[serde(default, alias = "targetAddress", skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<Role>,
    },
    Offer {
        #[serde(default, alias = "targetAddress", skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        offer: SessionDescription,
        #[serde(default, rename = "senderName", skip_serializing_if = "Option::is_none")]
        sender_name: Option<String>,
    },
    Answer {
        #[serde(default, alias = "targetAddress", skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        answer: SessionDescription,
        #[serde(
            default,
            rename = "senderName",
            alias = "receiverName",
            skip_serializing_if = "Option::is_none"
        )]
        sender_name: Option<String>,
    },
    Signal {
        #[serde(default, alias = "targetAddress", skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        signal: SessionDescription,
        #[serde(default, rename = "senderName", skip_serializing_if = "Option::is_none")]
        sender_name: Option<String>,
    },
    IceCandidate {
        #[serde(default, alias = "targetAddress", skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        candidate: Candidate,
        #[serde(default, rename = "senderName", skip_serializing_if = "Option::is_none")]
        sender_name: Option<String>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        message: String,
    },
}

impl From<Envelope> for WireMessage {
    fn from(envelope: Envelope) -> Self {
        let (room, sender_name, payload) = envelope.into_parts();
        let room = room.map(RoomKey::into_inner);
        match payload {
            Payload::Join { role } => {
                let room = room.unwrap_or_default();
                let target_address = (role == Role::Initiator).then(|| room.clone());
                WireMessage::Join {
                    room,
                    name: sender_name,
                    mode: Some(role),
                    target_address,
                }
            }
            Payload::PeerJoined { role } => WireMessage::UserJoined {
                room,
                name: sender_name,
                mode: role,
            },
            Payload::Description(desc) => match desc.kind {
                SdpKind::Offer => WireMessage::Offer {
                    room,
                    offer: desc,
                    sender_name,
                },
                SdpKind::Answer => WireMessage::Answer {
                    room,
                    answer: desc,
                    sender_name,
                },
            },
            Payload::Candidate(candidate) => WireMessage::IceCandidate {
                room,
                candidate,
                sender_name,
            },
            Payload::Error { message } => WireMessage::Error { room, message },
        }
    }
}

impl TryFrom<WireMessage> for Envelope {
    type Error = WireError;

    fn try_from(msg: WireMessage) -> Result<Self, Self::Error> {
        let to_room = |room: Option<String>| room.map(RoomKey::new);
        Ok(match msg {
            WireMessage::Join {
                room, name, mode, ..
            } => Envelope::new(
                Some(RoomKey::new(room)),
                name,
                Payload::Join {
                    role: mode.unwrap_or(Role::Responder),
                },
            ),
            WireMessage::UserJoined { room, name, mode } => {
                Envelope::new(to_room(room), name, Payload::PeerJoined { role: mode })
            }
            WireMessage::Offer {
                room,
                offer,
                sender_name,
            } => {
                if offer.kind != SdpKind::Offer {
                    return Err(WireError::KindMismatch("offer", offer.kind));
                }
                Envelope::new(to_room(room), sender_name, Payload::Description(offer))
            }
            WireMessage::Answer {
                room,
                answer,
                sender_name,
            } => {
                if answer.kind != SdpKind::Answer {
                    return Err(WireError::KindMismatch("answer", answer.kind));
                }
                Envelope::new(to_room(room), sender_name, Payload::Description(answer))
            }
            WireMessage::Signal {
                room,
                signal,
                sender_name,
            } => Envelope::new(to_room(room), sender_name, Payload::Description(signal)),
            WireMessage::IceCandidate {
                room,
                candidate,
                sender_name,
            } => Envelope::new(to_room(room), sender_name, Payload::Candidate(candidate)),
            WireMessage::Error { room, message } => {
                Envelope::new(to_room(room), None, Payload::Error { message })
            }
        })
    }
}

pub fn encode(envelope: Envelope) -> Result<String, WireError> {
    Ok(serde_json::to_string(&WireMessage::from(envelope))?)
}

pub fn decode(text: &str) -> Result<Envelope, WireError> {
    Envelope::try_from(serde_json::from_str::<WireMessage>(text)?)
}
