//! Transport zum Signaling-Relay
//!
//! Der Client spricht nur mit einem `RelayLink` (zwei Text-Kanäle). Wie die
//! Frames tatsächlich transportiert werden, entscheidet der `RelayConnector`.

use super::client::SignalingError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Eine offene Verbindung zum Relay
///
/// `inbound` endet (liefert `None`), sobald die Verbindung weg ist.
/// Fällt `outbound` weg, wird die Verbindung geschlossen.
#[derive(Debug)]
pub struct RelayLink {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

/// Baut Verbindungen zum Relay auf
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, url: &str, queue: usize) -> Result<RelayLink, SignalingError>;
}

// ============================================================================
// WEBSOCKET CONNECTOR
// ============================================================================

/// WebSocket-Transport über tokio-tungstenite
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

#[async_trait]
impl RelayConnector for WebSocketConnector {
    async fn connect(&self, url: &str, queue: usize) -> Result<RelayLink, SignalingError> {
        tracing::info!("Connecting to signaling relay: {}", url);

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(queue);
        let (in_tx, in_rx) = mpsc::channel::<String>(queue);

        // Read-Task: Text-Frames weiterreichen, bei Close/Fehler beenden
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        // Write-Task: läuft, bis der Client seinen Sender fallen lässt
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg.into())).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        Ok(RelayLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
