//! Record change notifications

use serde::Serialize;

/// Change of a cached record, published after the store was updated
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RecordEvent {
    /// Record was (re)loaded from a response or an update push
    Reloaded { model_name: String, gri: String },
    /// Record was marked deleted; it stays cached until unloaded
    Deleted { model_name: String, gri: String },
    ForbiddenChanged {
        model_name: String,
        gri: String,
        forbidden: bool,
    },
}

impl RecordEvent {
    pub fn gri(&self) -> &str {
        match self {
            RecordEvent::Reloaded { gri, .. }
            | RecordEvent::Deleted { gri, .. }
            | RecordEvent::ForbiddenChanged { gri, .. } => gri,
        }
    }
}
