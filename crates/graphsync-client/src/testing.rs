//! In-memory stand-in for the GraphSync server side of a socket
//!
//! `MemoryConnector` hands every opened socket to a [`MemoryListener`] as a
//! [`MockPeer`], which can read client requests and write responses, pushes
//! and batches back.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::transport::socket::{CloseEvent, Connector, OutboundFrame, SocketEvent, SocketHandle};

/// Close code sent back when the client closes the socket
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// Connector whose sockets end in a [`MockPeer`]
pub struct MemoryConnector {
    accept: mpsc::UnboundedSender<MockPeer>,
    fail_next: Mutex<Option<String>>,
}

/// Receives the server side of every socket opened through a [`MemoryConnector`]
pub struct MemoryListener {
    peers: mpsc::UnboundedReceiver<MockPeer>,
}

/// Create a connected connector/listener pair
pub fn memory_connector() -> (Arc<MemoryConnector>, MemoryListener) {
    let (accept, peers) = mpsc::unbounded_channel();
    (
        Arc::new(MemoryConnector {
            accept,
            fail_next: Mutex::new(None),
        }),
        MemoryListener { peers },
    )
}

impl MemoryConnector {
    /// Make the next `open` fail with `ConnectFailed(reason)`
    pub fn fail_next(&self, reason: impl Into<String>) {
        *self.fail_next.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.into());
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, url: &str) -> Result<SocketHandle, TransportError> {
        if let Some(reason) = self
            .fail_next
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return Err(TransportError::ConnectFailed(reason));
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<SocketEvent>();
        let (req_tx, req_rx) = mpsc::unbounded_channel::<Value>();

        // Client frames -> peer; a client close is confirmed right away
        let events = in_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                match frame {
                    OutboundFrame::Text(text) => match serde_json::from_str(&text) {
                        Ok(value) => {
                            let _ = req_tx.send(value);
                        }
                        Err(e) => tracing::warn!("MockPeer got invalid JSON: {}", e),
                    },
                    OutboundFrame::Close => {
                        let _ = events.send(SocketEvent::Closed(CloseEvent::new(NORMAL_CLOSE_CODE, "")));
                        break;
                    }
                }
            }
        });

        let peer = MockPeer {
            url: url.to_string(),
            requests: req_rx,
            events: in_tx,
        };
        self.accept
            .send(peer)
            .map_err(|_| TransportError::ConnectFailed("listener dropped".to_string()))?;

        Ok(SocketHandle {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

impl MemoryListener {
    /// Wait for the next opened socket
    pub async fn accept(&mut self) -> Option<MockPeer> {
        self.peers.recv().await
    }
}

/// Server side of one in-memory socket
pub struct MockPeer {
    pub url: String,
    requests: mpsc::UnboundedReceiver<Value>,
    events: mpsc::UnboundedSender<SocketEvent>,
}

impl MockPeer {
    /// Next request written by the client, `None` once the client is gone
    pub async fn recv_request(&mut self) -> Option<Value> {
        self.requests.recv().await
    }

    /// Next request, which must have the given subtype
    pub async fn expect_request(&mut self, subtype: &str) -> Value {
        let request = self
            .recv_request()
            .await
            .unwrap_or_else(|| panic!("client went away while waiting for {}", subtype));
        assert_eq!(request["subtype"], subtype, "unexpected request: {}", request);
        request
    }

    /// Answer the handshake with the given identity
    pub async fn answer_handshake(&mut self, identity: Value) -> Value {
        let request = self.expect_request("handshake").await;
        self.send(response_envelope(&request, handshake_payload(identity)));
        request
    }

    /// Write a raw JSON message
    pub fn send(&self, message: Value) {
        let _ = self.events.send(SocketEvent::Message(message.to_string()));
    }

    /// Write several envelopes as one `batch` message
    pub fn send_batch(&self, envelopes: Vec<Value>) {
        self.send(json!({ "batch": envelopes }));
    }

    pub fn respond(&self, request: &Value, payload: Value) {
        self.send(response_envelope(request, payload));
    }

    pub fn push(&self, subtype: &str, payload: Value) {
        self.send(push_envelope(subtype, payload));
    }

    /// Report a socket error to the client
    pub fn error(&self, reason: &str) {
        let _ = self.events.send(SocketEvent::Error(reason.to_string()));
    }

    /// Close the socket from the server side
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.events.send(SocketEvent::Closed(CloseEvent::new(code, reason)));
    }

    /// Answer every request with `handler`; requests it returns `None` for
    /// stay unanswered
    pub fn serve<F>(mut self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(&Value) -> Option<Value> + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(request) = self.recv_request().await {
                if let Some(payload) = handler(&request) {
                    self.respond(&request, payload);
                }
            }
        })
    }
}

/// `response` envelope answering `request`
pub fn response_envelope(request: &Value, payload: Value) -> Value {
    json!({ "id": request["id"].clone(), "type": "response", "payload": payload })
}

pub fn push_envelope(subtype: &str, payload: Value) -> Value {
    json!({ "type": "push", "subtype": subtype, "payload": payload })
}

/// Successful handshake payload with the given identity
pub fn handshake_payload(identity: Value) -> Value {
    json!({
        "success": true,
        "data": {
            "version": 3,
            "sessionId": "test-session",
            "identity": identity,
            "attributes": {
                "serviceVersion": "test",
                "globalTimeSeconds": Utc::now().timestamp(),
            },
        },
    })
}

/// Successful graph response carrying a resource
pub fn resource_payload(resource: Value) -> Value {
    json!({ "success": true, "data": { "format": "resource", "resource": resource } })
}

/// Successful graph response carrying a value
pub fn value_payload(value: Value) -> Value {
    json!({ "success": true, "data": { "format": "value", "value": value } })
}

pub fn void_payload() -> Value {
    json!({ "success": true })
}

pub fn error_payload(id: &str) -> Value {
    json!({ "success": false, "error": { "id": id } })
}

/// Payload of a graph push
pub fn graph_push_payload(update_type: &str, gri: &str, data: Option<Value>) -> Value {
    let mut payload = json!({ "updateType": update_type, "gri": gri });
    if let Some(data) = data {
        payload["data"] = data;
    }
    payload
}
