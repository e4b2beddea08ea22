//! Relation and token helpers built on graph requests

use graphsync_gri::{AuthHint, Gri, Scope};
use serde_json::json;

use super::service::{GraphOperation, GraphRequest, GraphResult, GraphService};
use crate::error::Result;
use crate::requests::RequestInfo;

impl GraphService {
    /// Join an entity of `entity_type` using an invite token
    pub async fn join_relation(
        &self,
        entity_type: &str,
        token: &str,
        auth_hint: Option<AuthHint>,
    ) -> Result<GraphResult> {
        let gri = Gri::new(entity_type, None, "join").with_scope(Scope::Private).encode()?;
        let request = GraphRequest::create(gri, json!({ "token": token }))
            .with_auth_hint(auth_hint)
            .with_subscribe(false);
        self.tracked(request).await
    }

    /// Remove the `aspect[,aspect_id]` relation of an entity
    pub async fn leave_relation(
        &self,
        entity_type: &str,
        entity_id: &str,
        aspect: &str,
        aspect_id: Option<&str>,
    ) -> Result<GraphResult> {
        let mut gri = Gri::new(entity_type, Some(entity_id), aspect).with_scope(Scope::Private);
        if let Some(aspect_id) = aspect_id {
            gri = gri.with_aspect_id(aspect_id);
        }
        let request = GraphRequest::delete(gri.encode()?).with_subscribe(false);
        self.tracked(request).await
    }

    pub async fn add_owner(&self, entity_type: &str, entity_id: &str, owner_id: &str) -> Result<GraphResult> {
        let gri = Gri::new(entity_type, Some(entity_id), "owner")
            .with_aspect_id(owner_id)
            .with_scope(Scope::Private)
            .encode()?;
        self.tracked(GraphRequest::new(gri, GraphOperation::Create).with_subscribe(false))
            .await
    }

    pub async fn remove_owner(&self, entity_type: &str, entity_id: &str, owner_id: &str) -> Result<GraphResult> {
        self.leave_relation(entity_type, entity_id, "owner", Some(owner_id))
            .await
    }

    /// Create an invite token for `receiver_type` to join the inviter
    ///
    /// Space-to-provider invitations use the dedicated support token aspect.
    pub async fn get_invite_token(
        &self,
        inviter_type: &str,
        inviter_id: &str,
        receiver_type: &str,
    ) -> Result<GraphResult> {
        let aspect = if inviter_type == "space" && receiver_type == "provider" {
            "space_support_token".to_string()
        } else {
            format!("invite_{}_token", receiver_type)
        };
        let gri = Gri::new(inviter_type, Some(inviter_id), aspect).encode()?;
        self.tracked(GraphRequest::new(gri, GraphOperation::Create).with_subscribe(false))
            .await
    }

    async fn tracked(&self, request: GraphRequest) -> Result<GraphResult> {
        let info = RequestInfo::graph(request.to_payload()?);
        self.tracker().track(info, self.request(request)).await
    }
}
