use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::{spawn, sync::mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::signaling::{wire, Envelope};

use super::{RelayConnector, RelayError, RelayEvent, RelayEvents, RelayHandle};

/// Connects to a relay speaking JSON text frames over a WebSocket (`ws://` or `wss://`).
#[derive(Clone, Debug, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl RelayConnector for WebSocketConnector {
    async fn connect(&self, relay_address: &str) -> Result<(RelayHandle, RelayEvents), RelayError> {
        info!("connecting to relay {}", relay_address);
        let (stream, _) = connect_async(relay_address)
            .await
            .map_err(|err| RelayError::Refused(err.to_string()))?;
        info!("relay connected");
        let (mut sink, mut stream) = stream.split();

        let open = Arc::new(AtomicBool::new(true));
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Envelope>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // NOTE: The writer is not tracked by the handle. It sends the close frame and exits once
        //       the handle drops its queue, so the relay sees an orderly close.
        {
            let open = open.clone();
            spawn(async move {
                while let Some(envelope) = outgoing_rx.recv().await {
                    let kind = envelope.kind();
                    let text = match wire::encode(envelope) {
                        Ok(ok) => ok,
                        Err(err) => {
                            warn!("failed to encode {:?}: {}", kind, err);
                            continue;
                        }
                    };
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        debug!("relay write failed: {}", err);
                        open.store(false, Ordering::Release);
                        return;
                    }
                }
                let _ = sink.close().await;
                debug!("relay writer finished");
            });
        }

        let reader = {
            let open = open.clone();
            spawn(async move {
                loop {
                    let event = match stream.next().await {
                        Some(Ok(Message::Text(text))) => match wire::decode(&text) {
                            Ok(envelope) => RelayEvent::Envelope(envelope),
                            Err(err) => {
                                warn!("{}", err);
                                continue;
                            }
                        },
                        Some(Ok(Message::Close(frame))) => {
                            debug!("relay closed the link: {:?}", frame);
                            RelayEvent::Closed
                        }
                        None => RelayEvent::Closed,
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => RelayEvent::Error(RelayError::LinkDropped(err.to_string())),
                    };
                    let last = !matches!(event, RelayEvent::Envelope(_));
                    if last {
                        open.store(false, Ordering::Release);
                    }
                    if event_tx.send(event).is_err() || last {
                        return;
                    }
                }
            })
        };

        Ok((RelayHandle::new(outgoing_tx, open, vec![reader]), event_rx))
    }
}
