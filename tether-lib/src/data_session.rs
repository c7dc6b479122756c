use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ChatMessage {
    pub sender: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InboundMessage {
    Structured(ChatMessage),
    /// A payload that is not a chat message, e.g. from a peer using another envelope.
    Raw {
        content: String,
        received_at: OffsetDateTime,
    },
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum DataSessionError {
    #[error("connection not ready")]
    NotReady,
    #[error("failed to encode message: {0}")]
    Encode(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ChannelState {
    Pending,
    Open,
    Closed,
}

/// Message framing over the negotiated channel.
///
/// Outgoing payloads go through `outgoing`, which is drained in order by a single writer, so
/// messages are never reordered.
pub struct DataSession {
    identity: String,
    state: ChannelState,
    outgoing: Option<mpsc::UnboundedSender<Bytes>>,
}

impl DataSession {
    pub fn new(identity: String, outgoing: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            identity,
            state: ChannelState::Pending,
            outgoing: Some(outgoing),
        }
    }

    /// Returns `true` only for the call that actually opened the session.
    pub fn open(&mut self) -> bool {
        if self.state != ChannelState::Pending {
            return false;
        }
        self.state = ChannelState::Open;
        true
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    pub fn send(&self, content: &str) -> Result<ChatMessage, DataSessionError> {
        if !self.is_open() {
            return Err(DataSessionError::NotReady);
        }
        let outgoing = self.outgoing.as_ref().ok_or(DataSessionError::NotReady)?;
        let msg = ChatMessage {
            sender: self.identity.clone(),
            content: content.to_owned(),
            timestamp: OffsetDateTime::now_utc(),
        };
        let data =
            serde_json::to_vec(&msg).map_err(|err| DataSessionError::Encode(err.to_string()))?;
        outgoing
            .send(Bytes::from(data))
            .map_err(|_| DataSessionError::NotReady)?;
        trace!("queued message ({} chars)", content.len());
        Ok(msg)
    }

    pub fn receive(&self, payload: &[u8]) -> InboundMessage {
        match serde_json::from_slice::<ChatMessage>(payload) {
            Ok(msg) => InboundMessage::Structured(msg),
            Err(err) => {
                debug!("unstructured payload: {}", err);
                InboundMessage::Raw {
                    content: String::from_utf8_lossy(payload).into_owned(),
                    received_at: OffsetDateTime::now_utc(),
                }
            }
        }
    }

    /// Returns `true` only for the call that actually closed the session.
    pub fn close(&mut self) -> bool {
        if self.state == ChannelState::Closed {
            return false;
        }
        self.state = ChannelState::Closed;
        self.outgoing = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (DataSession, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (DataSession::new("alice".into(), tx), rx)
    }

    #[test]
    fn send_fails_fast_before_open() {
        let (session, mut rx) = session();
        assert_eq!(session.send("hi"), Err(DataSessionError::NotReady));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn open_fires_once() {
        let (mut session, _rx) = session();
        assert!(session.open());
        assert!(!session.open());
        session.close();
        assert!(!session.open());
    }

    #[test]
    fn sent_messages_keep_order_and_identity() {
        let (mut session, mut rx) = session();
        session.open();
        for content in ["one", "two", "three"] {
            let msg = session.send(content).unwrap();
            assert_eq!(msg.sender, "alice");
        }
        let received = (0..3)
            .map(|_| serde_json::from_slice::<ChatMessage>(&rx.try_recv().unwrap()).unwrap())
            .map(|msg| msg.content)
            .collect::<Vec<_>>();
        assert_eq!(received, ["one", "two", "three"]);
    }

    #[test]
    fn browser_payload_is_structured() {
        let (session, _rx) = session();
        let payload =
            br#"{"sender":"bob","content":"hello","timestamp":"2024-05-01T10:20:30.123Z"}"#;
        let InboundMessage::Structured(msg) = session.receive(payload) else {
            panic!("expected structured message");
        };
        assert_eq!(msg.sender, "bob");
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.timestamp.year(), 2024);
    }

    #[test]
    fn unparseable_payload_is_raw() {
        let (session, _rx) = session();
        for payload in [
            &b"plain text"[..],
            &br#"{"text":"other envelope"}"#[..],
            &b"\xff\xfe"[..],
        ] {
            assert!(matches!(
                session.receive(payload),
                InboundMessage::Raw { .. }
            ));
        }
        let InboundMessage::Raw { content, .. } = session.receive(b"plain text") else {
            panic!("expected raw message");
        };
        assert_eq!(content, "plain text");
    }

    #[test]
    fn close_is_idempotent() {
        let (mut session, mut rx) = session();
        session.open();
        assert!(session.close());
        assert!(!session.close());
        assert_eq!(session.send("late"), Err(DataSessionError::NotReady));
        assert!(rx.try_recv().is_err());
    }
}
