use std::collections::HashMap;

use serde_json::Value;
use tether_lib::{
    signaling::{wire, Envelope, Payload},
    Role,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const ROOM_CAPACITY: usize = 2;

pub type ClientId = u64;

struct Member {
    id: ClientId,
    name: Option<String>,
    role: Role,
    outgoing: mpsc::UnboundedSender<String>,
}

impl Member {
    fn send(&self, text: String) {
        if self.outgoing.send(text).is_err() {
            debug!("client {} is gone", self.id);
        }
    }
}

fn send_envelope(outgoing: &mpsc::UnboundedSender<String>, envelope: Envelope) {
    match wire::encode(envelope) {
        Ok(text) => {
            let _ = outgoing.send(text);
        }
        Err(err) => warn!("failed to encode relay message: {}", err),
    }
}

/// Room registry. Frames other than `join` are routed by room and never interpreted.
#[derive(Default)]
pub struct Rooms {
    rooms: HashMap<String, Vec<Member>>,
    joined: HashMap<ClientId, String>,
}

impl Rooms {
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn members(&self, room: &str) -> usize {
        self.rooms.get(room).map_or(0, Vec::len)
    }

    pub fn handle_frame(
        &mut self,
        client: ClientId,
        outgoing: &mpsc::UnboundedSender<String>,
        text: &str,
    ) {
        let value = match serde_json::from_str::<Value>(text) {
            Ok(value) => value,
            Err(err) => {
                warn!("client {} sent an undecodable frame: {}", client, err);
                return;
            }
        };
        if value.get("type").and_then(Value::as_str) == Some("join") {
            match wire::decode(text) {
                Ok(envelope) => self.join(client, outgoing, envelope),
                Err(err) => warn!("client {} sent a bad join: {}", client, err),
            }
            return;
        }
        let room = value
            .get("room")
            .or_else(|| value.get("targetAddress"))
            .and_then(Value::as_str)
            .map(str::to_owned)
            .or_else(|| self.joined.get(&client).cloned());
        let Some(room) = room else {
            debug!("client {} sent a frame outside any room", client);
            return;
        };
        self.forward(client, &room, text);
    }

    fn join(
        &mut self,
        client: ClientId,
        outgoing: &mpsc::UnboundedSender<String>,
        envelope: Envelope,
    ) {
        let (room, name, payload) = envelope.into_parts();
        let (Some(room), Payload::Join { role }) = (room, payload) else {
            return;
        };
        self.leave(client);

        let members = self.rooms.entry(room.as_str().to_owned()).or_default();
        if members.len() >= ROOM_CAPACITY {
            info!("client {} refused: room {} is full", client, room);
            send_envelope(
                outgoing,
                Envelope::error(Some(room.clone()), "room is full".to_owned()),
            );
            return;
        }
        for member in members.iter() {
            send_envelope(
                &member.outgoing,
                Envelope::peer_joined(room.clone(), name.clone(), Some(role)),
            );
            send_envelope(
                outgoing,
                Envelope::peer_joined(room.clone(), member.name.clone(), Some(member.role)),
            );
        }
        members.push(Member {
            id: client,
            name,
            role,
            outgoing: outgoing.clone(),
        });
        info!(
            "client {} joined room {} as {} ({}/{})",
            client,
            room,
            role,
            members.len(),
            ROOM_CAPACITY
        );
        self.joined.insert(client, room.into_inner());
    }

    fn forward(&self, client: ClientId, room: &str, text: &str) {
        let Some(members) = self.rooms.get(room) else {
            debug!("room {} does not exist", room);
            return;
        };
        for member in members.iter().filter(|member| member.id != client) {
            member.send(text.to_owned());
        }
    }

    pub fn leave(&mut self, client: ClientId) {
        let Some(room) = self.joined.remove(&client) else {
            return;
        };
        let Some(members) = self.rooms.get_mut(&room) else {
            return;
        };
        members.retain(|member| member.id != client);
        debug!("client {} left room {}", client, room);
        if members.is_empty() {
            self.rooms.remove(&room);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct Client {
        id: ClientId,
        tx: mpsc::UnboundedSender<String>,
        rx: mpsc::UnboundedReceiver<String>,
    }

    impl Client {
        fn new(id: ClientId) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self { id, tx, rx }
        }

        fn send(&self, rooms: &mut Rooms, value: Value) {
            rooms.handle_frame(self.id, &self.tx, &value.to_string());
        }

        fn received(&mut self) -> Vec<Value> {
            let mut frames = vec![];
            while let Ok(text) = self.rx.try_recv() {
                frames.push(serde_json::from_str(&text).unwrap());
            }
            frames
        }
    }

    fn join(room: &str, name: &str, mode: &str) -> Value {
        json!({ "type": "join", "room": room, "name": name, "mode": mode })
    }

    #[test]
    fn joining_announces_both_ways() {
        let mut rooms = Rooms::default();
        let mut receiver = Client::new(1);
        let mut sender = Client::new(2);

        receiver.send(&mut rooms, join("r1", "bob", "receiver"));
        assert!(receiver.received().is_empty());

        sender.send(&mut rooms, join("r1", "alice", "sender"));
        assert_eq!(
            receiver.received(),
            [json!({ "type": "user-joined", "room": "r1", "name": "alice", "mode": "sender" })]
        );
        assert_eq!(
            sender.received(),
            [json!({ "type": "user-joined", "room": "r1", "name": "bob", "mode": "receiver" })]
        );
        assert_eq!(rooms.members("r1"), 2);
    }

    #[test]
    fn third_member_is_refused() {
        let mut rooms = Rooms::default();
        for client in (1..=2).map(Client::new) {
            client.send(&mut rooms, join("r1", "x", "receiver"));
        }
        let mut third = Client::new(3);
        third.send(&mut rooms, join("r1", "carol", "sender"));
        assert_eq!(
            third.received(),
            [json!({ "type": "error", "room": "r1", "message": "room is full" })]
        );
        assert_eq!(rooms.members("r1"), 2);
    }

    #[test]
    fn frames_are_forwarded_verbatim() {
        let mut rooms = Rooms::default();
        let mut a = Client::new(1);
        let mut b = Client::new(2);
        a.send(&mut rooms, join("r1", "alice", "sender"));
        b.send(&mut rooms, join("r1", "bob", "receiver"));
        a.received();
        b.received();

        let offer = json!({
            "type": "offer",
            "room": "r1",
            "offer": { "type": "offer", "sdp": "v=0" },
            "extra": [1, 2, 3],
        });
        a.send(&mut rooms, offer.clone());
        assert_eq!(b.received(), [offer]);
        assert!(a.received().is_empty());

        // no room in the frame: routed through the sender's room
        let candidate = json!({ "type": "ice-candidate", "candidate": { "candidate": "" } });
        b.send(&mut rooms, candidate.clone());
        assert_eq!(a.received(), [candidate]);
    }

    #[test]
    fn empty_rooms_are_dropped() {
        let mut rooms = Rooms::default();
        let a = Client::new(1);
        let b = Client::new(2);
        a.send(&mut rooms, join("r1", "alice", "sender"));
        b.send(&mut rooms, join("r1", "bob", "receiver"));
        rooms.leave(1);
        assert_eq!(rooms.members("r1"), 1);
        rooms.leave(2);
        rooms.leave(2);
        assert_eq!(rooms.room_count(), 0);

        b.send(&mut rooms, join("r2", "bob", "receiver"));
        b.send(&mut rooms, join("r3", "bob", "receiver"));
        assert_eq!(rooms.members("r2"), 0);
        assert_eq!(rooms.room_count(), 1);
    }

    #[test]
    fn garbage_is_ignored() {
        let mut rooms = Rooms::default();
        let mut a = Client::new(1);
        rooms.handle_frame(1, &a.tx, "not json");
        a.send(&mut rooms, json!({ "type": "join" }));
        assert!(a.received().is_empty());
        assert_eq!(rooms.room_count(), 0);
    }
}
