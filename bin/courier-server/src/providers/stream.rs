//! WebSocket duplex transport for streaming jobs.
//!
//! Bridges one WebSocket connection onto the engine's [`StreamConn`]: text
//! and binary messages from the provider are classified into tagged frames
//! and fed to the engine in arrival order; control frames from the engine go
//! out as text messages. Dropping the provider side (or a read error) closes
//! the engine's incoming channel, which the stream driver reports as a
//! connection-closed failure.

use bytes::Bytes;
use courier_core::{CoreError, Frame, STREAM_CHANNEL_CAPACITY, StreamConn, stream_pair};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

pub struct WsStreamTransport {
    url: String,
}

impl WsStreamTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Connect and return the engine's end of the duplex channel.
    pub async fn open(&self, app_id: &str) -> Result<StreamConn, CoreError> {
        let url = if self.url.contains('?') {
            format!("{}&app_id={app_id}", self.url)
        } else {
            format!("{}?app_id={app_id}", self.url)
        };
        let (ws, _) = connect_async(&url)
            .await
            .map_err(|e| CoreError::Transport(format!("stream connect failed: {e}")))?;
        debug!(%url, "stream transport connected");

        let (mut ws_tx, mut ws_rx) = ws.split();
        let (conn, peer) = stream_pair(STREAM_CHANNEL_CAPACITY);
        let mut engine_out = peer.incoming;
        let engine_in = peer.outgoing;

        // engine → provider: control frames as text, binary verbatim.
        tokio::spawn(async move {
            while let Some(frame) = engine_out.recv().await {
                let msg = match frame {
                    Frame::Control(value) => Message::Text(value.to_string()),
                    Frame::Binary(bytes) => Message::Binary(bytes.to_vec()),
                };
                if ws_tx.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.send(Message::Close(None)).await;
        });

        // provider → engine: classify each message once, preserve order.
        tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                let frame = match msg {
                    Ok(Message::Text(text)) => Frame::classify(Bytes::from(text)),
                    Ok(Message::Binary(data)) => Frame::classify(Bytes::from(data)),
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                    Ok(Message::Close(_)) | Ok(Message::Frame(_)) => break,
                    Err(e) => {
                        debug!(error = %e, "stream read error; closing channel");
                        break;
                    }
                };
                if engine_in.send(frame).await.is_err() {
                    break;
                }
            }
            // Dropping engine_in ends the engine's incoming channel.
        });

        Ok(conn)
    }
}
