//! Typed graph push events

use std::sync::Arc;

use graphsync_gri::AuthHint;
use serde_json::Value;

use crate::error::{ProtocolError, Result};
use crate::transport::{PushMessage, PushSubtype};

/// Change of a subscribed resource announced by the server
#[derive(Debug, Clone, PartialEq)]
pub enum GraphEvent {
    /// `push:graph` with `updateType: "updated"`
    Updated { gri: String, data: Value },
    /// `push:graph` with `updateType: "deleted"`
    Deleted { gri: String },
    /// `push:nosub` with `reason: "forbidden"`; the subscription is gone
    Forbidden {
        gri: String,
        auth_hint: Option<AuthHint>,
    },
}

impl GraphEvent {
    pub fn gri(&self) -> &str {
        match self {
            GraphEvent::Updated { gri, .. }
            | GraphEvent::Deleted { gri }
            | GraphEvent::Forbidden { gri, .. } => gri,
        }
    }
}

/// Receives graph events in arrival order
///
/// Listeners are held weakly by the graph service.
pub trait GraphEventListener: Send + Sync {
    fn on_graph_event(self: Arc<Self>, event: GraphEvent) -> Result<()>;
}

/// Parse a push frame; pushes of other subtypes yield `None`
pub fn parse_push(push: &PushMessage) -> Result<Option<GraphEvent>> {
    let payload = &push.payload;
    let gri = || -> Result<String> {
        payload
            .get("gri")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ProtocolError::MalformedPayload(format!("push without gri: {}", payload)).into())
    };

    match push.subtype {
        PushSubtype::Graph => {
            let update_type = payload.get("updateType").and_then(Value::as_str).unwrap_or_default();
            match update_type {
                "updated" => Ok(Some(GraphEvent::Updated {
                    gri: gri()?,
                    data: payload.get("data").cloned().unwrap_or(Value::Null),
                })),
                "deleted" => Ok(Some(GraphEvent::Deleted { gri: gri()? })),
                other => Err(ProtocolError::UnsupportedUpdateType(other.to_string()).into()),
            }
        }
        PushSubtype::Nosub => {
            let reason = payload.get("reason").and_then(Value::as_str).unwrap_or_default();
            match reason {
                "forbidden" => {
                    let auth_hint = match payload.get("authHint").and_then(Value::as_str) {
                        Some(raw) => match AuthHint::parse_wire(raw) {
                            Ok(hint) => Some(hint),
                            Err(e) => {
                                tracing::warn!("Ignoring auth hint of nosub push: {}", e);
                                None
                            }
                        },
                        None => None,
                    };
                    Ok(Some(GraphEvent::Forbidden {
                        gri: gri()?,
                        auth_hint,
                    }))
                }
                other => Err(ProtocolError::UnsupportedNosubReason(other.to_string()).into()),
            }
        }
        PushSubtype::Error | PushSubtype::Other(_) => Ok(None),
    }
}
