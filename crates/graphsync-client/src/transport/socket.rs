//! Physical socket abstraction
//!
//! A `Connector` opens a socket and hands back a pair of channels: outbound
//! frames to write and inbound socket events. The transport channel never
//! touches the socket library directly, so the same state machine runs over
//! a real WebSocket or an in-memory peer.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;

/// Close code used when the socket went away without a close frame
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// Frame written by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    /// Start the close handshake
    Close,
}

/// Close notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub code: u16,
    pub reason: String,
}

impl CloseEvent {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(ABNORMAL_CLOSE_CODE, reason)
    }
}

/// Event observed on the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Message(String),
    Error(String),
    /// Always the last event of a socket
    Closed(CloseEvent),
}

/// An opened socket
pub struct SocketHandle {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Opens sockets to the GraphSync endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str) -> Result<SocketHandle, TransportError>;
}

/// `Connector` backed by tokio-tungstenite
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &str) -> Result<SocketHandle, TransportError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        tracing::info!("WebSocket opened: {}", url);

        let (mut ws_tx, mut ws_rx) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<SocketEvent>();

        // Writer task: client frames -> socket
        let writer_events = in_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let result = match frame {
                    OutboundFrame::Text(text) => ws_tx.send(Message::Text(text.into())).await,
                    OutboundFrame::Close => ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "".into(),
                        })))
                        .await,
                };
                if let Err(e) = result {
                    let _ = writer_events.send(SocketEvent::Error(e.to_string()));
                    break;
                }
            }
        });

        // Reader task: socket -> events, ends with exactly one Closed
        tokio::spawn(async move {
            let close = loop {
                match ws_rx.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(SocketEvent::Message(text.as_str().to_string())).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => {
                            let _ = in_tx.send(SocketEvent::Message(text));
                        }
                        Err(e) => {
                            tracing::warn!("Dropping non UTF-8 binary frame: {}", e);
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| CloseEvent::new(u16::from(f.code), f.reason.as_str().to_string()))
                            .unwrap_or_else(|| CloseEvent::new(1005, ""));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = in_tx.send(SocketEvent::Error(e.to_string()));
                        break CloseEvent::abnormal(e.to_string());
                    }
                    None => break CloseEvent::abnormal("stream ended"),
                }
            };
            let _ = in_tx.send(SocketEvent::Closed(close));
        });

        Ok(SocketHandle {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
