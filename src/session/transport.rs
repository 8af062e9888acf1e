//! Persistent bidirectional text transport
//!
//! A connector opens a link made of two channels: outbound text frames and
//! inbound text frames. Closing the outbound sender closes the connection;
//! the inbound stream ends when the remote side closes or the network fails.

use std::sync::Once;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::client::SessionError;

/// Outcome of reading from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireInbound {
    /// One text frame
    Text(String),
    /// A fault that does not by itself end the connection
    Error(String),
    /// The connection ended; the reason is for logging
    Closed(String),
}

/// Open connection to the conversation service
pub struct WireLink {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<WireInbound>,
}

/// Opens connections to the conversation endpoint
#[async_trait]
pub trait SessionConnector: Send + Sync + 'static {
    /// Connect to `url`; resolves once the transport reports open
    async fn open(&self, url: &str) -> Result<WireLink, SessionError>;
}

/// WebSocket connector over TLS
#[derive(Debug, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        install_crypto_provider();
        Self
    }
}

/// Select the process-wide TLS crypto backend; later calls are no-ops
pub fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("TLS crypto provider already installed");
        }
    });
}

#[async_trait]
impl SessionConnector for WsConnector {
    async fn open(&self, url: &str) -> Result<WireLink, SessionError> {
        install_crypto_provider();
        let (socket, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| SessionError::Connect(e.to_string()))?;
        debug!(status = %response.status(), "websocket open");

        let (mut sink, mut stream) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let writer_tx = inbound_tx.clone();

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!(error = %e, "websocket send failed");
                    let _ = writer_tx
                        .send(WireInbound::Error(format!("send failed: {}", e)))
                        .await;
                    let _ = writer_tx
                        .send(WireInbound::Closed("send failed".to_string()))
                        .await;
                    return;
                }
            }
            // Outbound side dropped: local close
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
            debug!("websocket writer finished");
        });

        tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx.send(WireInbound::Text(text)).await.is_err() {
                            break "client dropped".to_string();
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            if inbound_tx.send(WireInbound::Text(text)).await.is_err() {
                                break "client dropped".to_string();
                            }
                        }
                        Err(_) => debug!("dropping non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| format!("closed by server: {} {}", u16::from(f.code), f.reason))
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("transport error: {}", e),
                    None => break "connection ended".to_string(),
                }
            };
            let _ = inbound_tx.send(WireInbound::Closed(reason)).await;
        });

        Ok(WireLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
