//! Wire envelopes of the GraphSync protocol
//!
//! Outbound: `{ id, type: "request", subtype, payload }`.
//! Inbound: a single envelope or `{ batch: [envelope, ...] }`, where an
//! envelope is either a `response` (correlated by id) or a `push`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{BackendError, ProtocolError, TransportError};

/// Channel a request is sent on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestSubtype {
    Handshake,
    Rpc,
    Graph,
    Unsub,
}

/// Outbound request envelope
#[derive(Debug, Clone, Serialize)]
pub struct RequestMessage {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub message_type: &'static str,
    pub subtype: RequestSubtype,
    pub payload: Value,
}

impl RequestMessage {
    pub fn new(id: Uuid, subtype: RequestSubtype, payload: Value) -> Self {
        Self {
            id,
            message_type: "request",
            subtype,
            payload,
        }
    }
}

/// Payload of every response envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BackendError>,
}

impl ResponsePayload {
    /// Successful data, or the backend error when `success` is false
    pub fn into_result(self) -> Result<Option<Value>, BackendError> {
        if self.success {
            Ok(self.data)
        } else {
            Err(self
                .error
                .unwrap_or_else(|| BackendError::new("unknownError")))
        }
    }
}

/// Subtype of a push envelope
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PushSubtype {
    Graph,
    Nosub,
    Error,
    Other(String),
}

impl From<&str> for PushSubtype {
    fn from(value: &str) -> Self {
        match value {
            "graph" => PushSubtype::Graph,
            "nosub" => PushSubtype::Nosub,
            "error" => PushSubtype::Error,
            other => PushSubtype::Other(other.to_string()),
        }
    }
}

/// Server push without an associated request
#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    pub subtype: PushSubtype,
    pub payload: Value,
}

/// One decoded inbound envelope
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Response { id: Uuid, payload: ResponsePayload },
    Push(PushMessage),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum RawEnvelope {
    Response {
        id: Uuid,
        payload: ResponsePayload,
    },
    Push {
        subtype: String,
        #[serde(default)]
        payload: Value,
    },
}

/// Split a socket message into envelopes, preserving batch order
pub fn split_batch(text: &str) -> Result<Vec<Value>, TransportError> {
    let mut data: Value =
        serde_json::from_str(text).map_err(|e| TransportError::InvalidFrame(e.to_string()))?;
    match data.get_mut("batch").map(Value::take) {
        Some(Value::Array(batch)) => Ok(batch),
        Some(other) => Err(TransportError::InvalidFrame(format!(
            "batch is not an array: {}",
            other
        ))),
        None => Ok(vec![data]),
    }
}

/// Decode a single envelope
///
/// A push carrying a `badMessage` error for one of our requests is turned
/// into a response for that request, since the server reports some request
/// errors that way.
pub fn decode_envelope(envelope: Value) -> Result<InboundMessage, ProtocolError> {
    if let Some(id) = bad_message_id(&envelope) {
        let payload = envelope.get("payload").cloned().unwrap_or_default();
        let error = payload
            .get("error")
            .cloned()
            .and_then(|e| serde_json::from_value(e).ok());
        return Ok(InboundMessage::Response {
            id,
            payload: ResponsePayload {
                success: false,
                data: None,
                error,
            },
        });
    }

    let message_type = envelope
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if message_type != "response" && message_type != "push" {
        return Err(ProtocolError::UnknownMessageType(message_type));
    }

    match serde_json::from_value::<RawEnvelope>(envelope) {
        Ok(RawEnvelope::Response { id, payload }) => Ok(InboundMessage::Response { id, payload }),
        Ok(RawEnvelope::Push { subtype, payload }) => Ok(InboundMessage::Push(PushMessage {
            subtype: PushSubtype::from(subtype.as_str()),
            payload,
        })),
        Err(e) => Err(ProtocolError::MalformedPayload(e.to_string())),
    }
}

fn bad_message_id(envelope: &Value) -> Option<Uuid> {
    if envelope.get("type").and_then(Value::as_str) != Some("push") {
        return None;
    }
    let error = envelope.get("payload")?.get("error")?;
    if error.get("id").and_then(Value::as_str) != Some("badMessage") {
        return None;
    }
    // details.message is the offending request, serialized
    let request: Value = match error.get("details")?.get("message")? {
        Value::String(raw) => serde_json::from_str(raw).ok()?,
        other => other.clone(),
    };
    request.get("id")?.as_str()?.parse().ok()
}
