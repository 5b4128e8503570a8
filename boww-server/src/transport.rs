//! WebSocket endpoint.
//!
//! One accept loop; per connection, a writer task draining the session's
//! outbound control channel and a reader loop feeding the server core.
//! Binary PCM is forwarded through a bounded channel into a blocking
//! worker, so VAD inference and sink writes back-pressure the socket
//! instead of stalling the async executor.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use boww_core::protocol::{decode_pcm_le, ServerMessage};

use crate::server::Server;

/// Bounded frames in flight between the socket reader and the pipeline
/// worker; at 32-sample-millisecond frames this is seconds of slack.
const AUDIO_CHANNEL_CAPACITY: usize = 64;

/// Accept connections until the listener fails.
pub async fn run(server: Arc<Server>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening for websocket clients");

    loop {
        let (stream, peer) = listener.accept().await?;
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(server, stream).await {
                debug!(%peer, "connection ended: {e}");
            }
        });
    }
}

async fn handle_connection(server: Arc<Server>, stream: TcpStream) -> anyhow::Result<()> {
    let socket = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let session = server.register(outbound_tx);
    let conn_id = session.conn_id();
    drop(session);

    // Writer: serialize queued control messages onto the socket.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    error!(conn_id, "failed to encode control message: {e}");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Pipeline worker: blocking AGC/VAD/sink work off the async executor.
    let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<i16>>(AUDIO_CHANNEL_CAPACITY);
    let audio_server = Arc::clone(&server);
    let audio_worker = tokio::task::spawn_blocking(move || {
        while let Some(pcm) = audio_rx.blocking_recv() {
            audio_server.on_audio(conn_id, &pcm);
        }
    });

    // Reader: demux text and binary frames until the peer goes away.
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => server.on_text(conn_id, &text),
            Ok(Message::Binary(data)) => {
                if audio_tx.send(decode_pcm_le(&data)).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            // tungstenite answers pings during read; nothing to do here.
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(e) => {
                warn!(conn_id, "websocket error: {e}");
                break;
            }
        }
    }

    server.on_close(conn_id);
    drop(audio_tx);
    let _ = audio_worker.await;
    writer.abort();
    Ok(())
}
