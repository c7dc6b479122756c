mod rooms;
mod tracing_helper;

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, Mutex},
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::rooms::{ClientId, Rooms};

/// Relay that pairs tether peers by room.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    #[arg(long, default_value = "0.0.0.0:9000")]
    listen: SocketAddr,
    /// Log without timestamps or colors
    #[arg(long)]
    plain_log: bool,
}

async fn handle(
    stream: TcpStream,
    client: ClientId,
    rooms: Arc<Mutex<Rooms>>,
) -> Result<()> {
    let ws = accept_async(stream)
        .await
        .context("websocket handshake failed")?;
    let (mut sink, mut stream) = ws.split();

    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(text) = outgoing_rx.recv().await {
            if let Err(err) = sink.send(Message::Text(text)).await {
                debug!("client {} write failed: {}", client, err);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let result = async {
        while let Some(msg) = stream.next().await {
            match msg? {
                Message::Text(text) => {
                    rooms
                        .lock()
                        .await
                        .handle_frame(client, &outgoing_tx, &text);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;
    writer.abort();
    result
}

async fn serve(stream: TcpStream, addr: SocketAddr, client: ClientId, rooms: Arc<Mutex<Rooms>>) {
    info!("client {} connected from {}", client, addr);
    if let Err(err) = handle(stream, client, rooms.clone()).await {
        warn!("client {}: {:#}", client, err);
    }
    rooms.lock().await.leave(client);
    info!("client {} disconnected", client);
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_helper::init_tracing(args.plain_log)?;

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to listen on {}", args.listen))?;
    info!("listening on {}", args.listen);

    let rooms = Arc::new(Mutex::new(Rooms::default()));
    let mut last_client: ClientId = 0;
    loop {
        let (stream, addr) = listener.accept().await?;
        last_client += 1;
        tokio::spawn(serve(stream, addr, last_client, rooms.clone()));
    }
}
