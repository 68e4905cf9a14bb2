use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::engine::error::TransportError;

use super::{Link, Transport};

/// Transport over a WebSocket connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &str) -> Result<Link, TransportError> {
        let (socket, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Open(e.to_string()))?;

        info!(%url, "WebSocket connected");

        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        // Write loop: session frames -> WebSocket frames
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = ws_sender.send(Message::text(frame)).await {
                    warn!(error = %e, "WebSocket write error");
                    break;
                }
            }
            let _ = ws_sender.close().await;
            debug!("WebSocket write loop finished");
        });

        // Read loop: WebSocket frames -> session frames
        tokio::spawn(async move {
            while let Some(msg_result) = ws_receiver.next().await {
                let msg = match msg_result {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(error = %e, "WebSocket read error");
                        break;
                    }
                };

                match msg {
                    Message::Text(text) => {
                        if inbound_tx.send(text.as_str().to_owned()).is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {} // tungstenite answers pings itself
                }
            }
            debug!("WebSocket read loop finished");
        });

        Ok(Link {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
