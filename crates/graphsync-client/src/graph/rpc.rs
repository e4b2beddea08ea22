//! RPC calls over the GraphSync channel

use serde_json::{json, Value};

use crate::error::{Result, SyncError};
use crate::requests::{ActiveRequestTracker, RequestInfo};
use crate::transport::{RequestSubtype, TransportChannel};

/// Sends `rpc` requests (`{ function, args }`)
#[derive(Debug, Clone)]
pub struct RpcService {
    channel: TransportChannel,
    tracker: ActiveRequestTracker,
}

impl RpcService {
    pub fn new(channel: TransportChannel, tracker: ActiveRequestTracker) -> Self {
        Self { channel, tracker }
    }

    /// Call `method` and return the response data (`null` when absent)
    pub async fn request(&self, method: &str, args: Value) -> Result<Value> {
        let info = RequestInfo::rpc(method, args.clone());
        self.tracker
            .track(info, async {
                tracing::debug!("RPC {}", method);
                let response = self
                    .channel
                    .send(RequestSubtype::Rpc, json!({ "function": method, "args": args }))
                    .await?;
                Ok::<_, SyncError>(response.into_result()?.unwrap_or(Value::Null))
            })
            .await
    }
}
