//! Socket boundary for the gateway connection.
//!
//! The transport layer has no protocol knowledge: it moves text frames in
//! both directions and reports lifecycle events. Everything above it is
//! written against the [`Transport`]/[`Connector`] traits so tests can
//! substitute a channel-backed fake for the real WebSocket.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use clawlink_core::ClientError;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

/// Lifecycle events emitted by a transport instance.
#[derive(Debug)]
pub enum TransportEvent {
    /// One inbound text frame.
    Message(String),
    /// The socket closed. Only the currently open instance is valid;
    /// holders must discard their handle after seeing this.
    Closed { code: Option<u16> },
    /// Socket-level error. A `Closed` event follows.
    Error(String),
}

/// Write half of an open socket.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one text frame.
    ///
    /// # Errors
    /// Fails with [`ClientError::NotConnected`] if the socket is no longer
    /// open.
    async fn send(&self, text: String) -> Result<(), ClientError>;

    /// Close the socket. Idempotent.
    async fn close(&self);
}

/// A freshly opened connection: the write half plus its event stream.
pub struct Connection {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Factory for transports. Each call dials a new socket.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to the gateway.
    ///
    /// # Errors
    /// Fails with [`ClientError::Transport`] if the dial or TLS setup fails.
    async fn connect(&self, url: &str) -> Result<Connection, ClientError>;
}

enum WsCommand {
    Text(String),
    Close,
}

/// WebSocket transport over tokio-tungstenite.
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Connection, ClientError> {
        let url = Url::parse(url).map_err(|e| ClientError::Transport(format!("invalid url: {e}")))?;
        let (socket, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        tracing::debug!(%url, "websocket open");

        let (mut sink, mut stream) = socket.split();
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<WsCommand>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();

        // Writer: forward outbound frames until the command channel or the
        // sink drops.
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    WsCommand::Text(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    WsCommand::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        // Reader: surface inbound text and the close, dropping everything
        // else (tungstenite answers pings internally).
        tokio::spawn(async move {
            let mut close_code = None;
            while let Some(next) = stream.next().await {
                match next {
                    Ok(Message::Text(text)) => {
                        if event_tx.send(TransportEvent::Message(text.to_string())).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Binary(data)) => {
                        if let Ok(text) = String::from_utf8(data.to_vec()) {
                            if event_tx.send(TransportEvent::Message(text)).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        close_code = frame.map(|f| u16::from(f.code));
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = event_tx.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
            let _ = event_tx.send(TransportEvent::Closed { code: close_code });
        });

        Ok(Connection {
            transport: Arc::new(WsTransport {
                cmd_tx,
                closed: AtomicBool::new(false),
            }),
            events: event_rx,
        })
    }
}

struct WsTransport {
    cmd_tx: mpsc::UnboundedSender<WsCommand>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, text: String) -> Result<(), ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::NotConnected);
        }
        self.cmd_tx
            .send(WsCommand::Text(text))
            .map_err(|_| ClientError::NotConnected)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.cmd_tx.send(WsCommand::Close);
        }
    }
}
