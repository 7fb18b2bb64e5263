use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::{Transport, TransportConnector};

/// Endpoint configuration for the WebSocket transport.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Host (and optional port/path) of the tracking broker.
    pub endpoint: String,
}

impl WebSocketConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    /// Full WebSocket URL. Bare host names get a scheme picked for them:
    /// `ws://` for loopback, `wss://` for everything else.
    pub fn url(&self) -> String {
        if self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://") {
            return self.endpoint.clone();
        }
        if self.endpoint.contains("localhost") || self.endpoint.contains("127.0.0.1") {
            format!("ws://{}", self.endpoint)
        } else {
            format!("wss://{}", self.endpoint)
        }
    }
}

/// WebSocket implementation of the [`Transport`] trait. Frames are JSON text
/// messages; a spawned pump task bridges the socket and a pair of in-memory
/// channels so callers never touch the stream directly.
pub struct WebSocketTransport {
    tx_out: mpsc::UnboundedSender<Vec<u8>>,
    rx_in: mpsc::UnboundedReceiver<Vec<u8>>,
    connected: Arc<AtomicBool>,
    pump: Option<tokio::task::JoinHandle<()>>,
}

impl WebSocketTransport {
    pub async fn connect(config: &WebSocketConfig) -> Result<Self> {
        let (ws_stream, _) = connect_async(config.url()).await?;

        let (tx_out, rx_out) = mpsc::unbounded_channel::<Vec<u8>>();
        let (tx_in, rx_in) = mpsc::unbounded_channel::<Vec<u8>>();
        let connected = Arc::new(AtomicBool::new(true));

        let pump = tokio::spawn(pump_socket(ws_stream, rx_out, tx_in, connected.clone()));

        Ok(Self {
            tx_out,
            rx_in,
            connected,
            pump: Some(pump),
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(anyhow::anyhow!("websocket not connected"));
        }
        self.tx_out
            .send(data.to_vec())
            .map_err(|err| anyhow::anyhow!("failed to queue frame: {err}"))
    }

    async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx_in.recv().await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

async fn pump_socket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx_out: mpsc::UnboundedReceiver<Vec<u8>>,
    tx_in: mpsc::UnboundedSender<Vec<u8>>,
    connected: Arc<AtomicBool>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let send_task = tokio::spawn(async move {
        while let Some(data) = rx_out.recv().await {
            let text = match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => continue, // frames are JSON; anything else is a bug upstream
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if tx_in.send(text.into_bytes()).is_err() {
                    break;
                }
            }
            Ok(Message::Binary(data)) => {
                if tx_in.send(data).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {} // Ping/Pong handled by tungstenite
        }
    }

    connected.store(false, Ordering::SeqCst);
    send_task.abort();
    let _ = send_task.await;
}

/// Connector producing one [`WebSocketTransport`] per connection attempt.
pub struct WebSocketConnector {
    config: WebSocketConfig,
}

impl WebSocketConnector {
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        let transport = WebSocketTransport::connect(&self.config).await?;
        Ok(Box::new(transport))
    }
}
