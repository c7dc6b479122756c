use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tether_lib::{
    relay::{RelayConnector, RelayError, RelayEvent, WebSocketConnector},
    signaling::Payload,
    Role, RoomKey,
};
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};

#[tokio::test]
async fn websocket_link_speaks_the_relay_protocol() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let Some(Ok(Message::Text(join))) = ws.next().await else {
            panic!("expected a join frame");
        };
        ws.send(Message::Text("not json".into())).await.unwrap();
        ws.send(Message::Text(
            json!({ "type": "peer-found", "targetAddress": "lobby", "name": "bob" }).to_string(),
        ))
        .await
        .unwrap();
        ws.close(None).await.unwrap();
        serde_json::from_str::<Value>(&join).unwrap()
    });

    let (mut handle, mut events) = WebSocketConnector
        .connect(&format!("ws://{}", addr))
        .await
        .unwrap();
    assert!(handle.is_open());
    handle.join(&RoomKey::new("lobby"), "alice", Role::Responder);

    let Some(RelayEvent::Envelope(envelope)) = events.recv().await else {
        panic!("expected an envelope");
    };
    assert_eq!(envelope.room(), &Some(RoomKey::new("lobby")));
    assert_eq!(envelope.sender().as_deref(), Some("bob"));
    assert_eq!(envelope.payload(), &Payload::PeerJoined { role: None });
    assert!(matches!(events.recv().await, Some(RelayEvent::Closed)));
    assert!(!handle.is_open());

    assert_eq!(
        server.await.unwrap(),
        json!({ "type": "join", "room": "lobby", "name": "alice", "mode": "receiver" })
    );
    handle.close();
    handle.close();
}

#[tokio::test]
async fn unreachable_relay_is_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = WebSocketConnector
        .connect(&format!("ws://{}", addr))
        .await;
    assert!(matches!(result, Err(RelayError::Refused(_))));
}
