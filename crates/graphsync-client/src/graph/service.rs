//! Graph request service
//!
//! Issues `graph` requests over the transport channel, debounces
//! unsubscriptions and turns `graph`/`nosub` pushes into
//! [`GraphEvent`](super::GraphEvent)s.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use graphsync_gri::AuthHint;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::event::{parse_push, GraphEventListener};
use crate::error::Result;
use crate::requests::ActiveRequestTracker;
use crate::transport::{PushListener, PushMessage, RequestSubtype, TransportChannel};

/// Operation of a graph request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphOperation {
    Get,
    Create,
    Update,
    Delete,
}

impl GraphOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphOperation::Get => "get",
            GraphOperation::Create => "create",
            GraphOperation::Update => "update",
            GraphOperation::Delete => "delete",
        }
    }

    /// Only `get` and `create` can open a subscription
    pub fn can_subscribe(&self) -> bool {
        matches!(self, GraphOperation::Get | GraphOperation::Create)
    }
}

impl fmt::Display for GraphOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single graph request
#[derive(Debug, Clone, PartialEq)]
pub struct GraphRequest {
    pub gri: String,
    pub operation: GraphOperation,
    pub data: Option<Value>,
    pub auth_hint: Option<AuthHint>,
    pub subscribe: bool,
}

impl GraphRequest {
    /// Request with `subscribe` on, as the server expects by default
    pub fn new(gri: impl Into<String>, operation: GraphOperation) -> Self {
        Self {
            gri: gri.into(),
            operation,
            data: None,
            auth_hint: None,
            subscribe: true,
        }
    }

    pub fn get(gri: impl Into<String>) -> Self {
        Self::new(gri, GraphOperation::Get)
    }

    pub fn create(gri: impl Into<String>, data: Value) -> Self {
        Self::new(gri, GraphOperation::Create).with_data(data)
    }

    pub fn update(gri: impl Into<String>, data: Value) -> Self {
        Self::new(gri, GraphOperation::Update).with_data(data)
    }

    pub fn delete(gri: impl Into<String>) -> Self {
        Self::new(gri, GraphOperation::Delete)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_auth_hint(mut self, auth_hint: Option<AuthHint>) -> Self {
        self.auth_hint = auth_hint;
        self
    }

    pub fn with_subscribe(mut self, subscribe: bool) -> Self {
        self.subscribe = subscribe;
        self
    }

    /// Subscription flag actually sent; forced off for update and delete
    pub fn effective_subscribe(&self) -> bool {
        self.operation.can_subscribe() && self.subscribe
    }

    /// Wire payload; fails on an invalid auth hint
    pub fn to_payload(&self) -> Result<Value> {
        let mut message = Map::new();
        message.insert("gri".into(), Value::String(self.gri.clone()));
        message.insert("operation".into(), Value::String(self.operation.as_str().into()));
        if let Some(ref data) = self.data {
            message.insert("data".into(), data.clone());
        }
        message.insert("subscribe".into(), Value::Bool(self.effective_subscribe()));
        if let Some(ref hint) = self.auth_hint {
            hint.validate()?;
            message.insert("authHint".into(), Value::String(hint.to_wire()));
        }
        Ok(Value::Object(message))
    }
}

/// Successful result of a graph request, by response `format`
#[derive(Debug, Clone, PartialEq)]
pub enum GraphResult {
    Resource(Value),
    Value(Value),
    /// No data, or a format this client does not know
    Void,
}

impl GraphResult {
    pub fn from_response_data(data: Option<Value>) -> Self {
        let Some(mut data) = data else {
            return GraphResult::Void;
        };
        match data.get("format").and_then(Value::as_str) {
            Some("resource") => GraphResult::Resource(data.get_mut("resource").map(Value::take).unwrap_or_default()),
            Some("value") => GraphResult::Value(data.get_mut("value").map(Value::take).unwrap_or_default()),
            _ => GraphResult::Void,
        }
    }

    pub fn into_resource(self) -> Option<Value> {
        match self {
            GraphResult::Resource(resource) => Some(resource),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            GraphResult::Value(value) | GraphResult::Resource(value) => Some(value),
            GraphResult::Void => None,
        }
    }
}

struct ScheduledUnsubscription {
    token: u64,
    timer: JoinHandle<()>,
}

type Listeners = RwLock<Vec<Weak<dyn GraphEventListener>>>;

struct GraphInner {
    channel: TransportChannel,
    tracker: ActiveRequestTracker,
    unsubscribe_delay: Duration,
    scheduled: Mutex<HashMap<String, ScheduledUnsubscription>>,
    next_token: AtomicU64,
    listeners: Arc<Listeners>,
}

/// Graph request service of one session
#[derive(Clone)]
pub struct GraphService {
    inner: Arc<GraphInner>,
}

/// Push listener installed on the transport channel
struct GraphPushRouter {
    listeners: Arc<Listeners>,
}

impl PushListener for GraphPushRouter {
    fn on_push(&self, push: &PushMessage) -> Result<()> {
        let Some(event) = parse_push(push)? else {
            debug!("Ignoring push of subtype {:?}", push.subtype);
            return Ok(());
        };
        let listeners: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for listener in listeners {
            if let Err(e) = listener.on_graph_event(event.clone()) {
                error!("Handling graph event for {} failed: {}", event.gri(), e);
            }
        }
        Ok(())
    }
}

impl GraphService {
    pub fn new(channel: TransportChannel, tracker: ActiveRequestTracker, unsubscribe_delay: Duration) -> Self {
        let listeners: Arc<Listeners> = Arc::new(RwLock::new(Vec::new()));
        channel.add_push_listener(Arc::new(GraphPushRouter {
            listeners: listeners.clone(),
        }));
        Self {
            inner: Arc::new(GraphInner {
                channel,
                tracker,
                unsubscribe_delay,
                scheduled: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(0),
                listeners,
            }),
        }
    }

    pub fn channel(&self) -> &TransportChannel {
        &self.inner.channel
    }

    pub fn tracker(&self) -> &ActiveRequestTracker {
        &self.inner.tracker
    }

    pub fn unsubscribe_delay(&self) -> Duration {
        self.inner.unsubscribe_delay
    }

    /// Register a listener for push events; dropped listeners are skipped
    pub fn add_listener(&self, listener: Weak<dyn GraphEventListener>) {
        let mut listeners = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|l| l.strong_count() > 0);
        listeners.push(listener);
    }

    /// Send a graph request
    ///
    /// Cancels a scheduled unsubscription of the same GRI first. An invalid
    /// auth hint fails before anything is written.
    pub async fn request(&self, request: GraphRequest) -> Result<GraphResult> {
        let payload = request.to_payload()?;
        self.cancel_scheduled_unsubscription(&request.gri);

        let response = self.inner.channel.send(RequestSubtype::Graph, payload).await?;
        let data = response.into_result()?;
        Ok(GraphResult::from_response_data(data))
    }

    /// Arm a debounced unsubscription of `gri`
    ///
    /// Returns false, without arming a second timer, if one is already
    /// pending.
    pub fn schedule_unsubscription(&self, gri: &str) -> bool {
        let mut scheduled = self.lock_scheduled();
        if scheduled.contains_key(gri) {
            return false;
        }

        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let service = self.clone();
        let target = gri.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(service.inner.unsubscribe_delay).await;
            let due = {
                let mut scheduled = service.lock_scheduled();
                match scheduled.get(&target) {
                    Some(entry) if entry.token == token => scheduled.remove(&target).is_some(),
                    _ => false,
                }
            };
            if due {
                if let Err(e) = service.send_unsub(&target).await {
                    warn!("Scheduled unsubscription of {} failed: {}", target, e);
                }
            }
        });
        scheduled.insert(gri.to_string(), ScheduledUnsubscription { token, timer });
        debug!("Scheduled unsubscription of {}", gri);
        true
    }

    /// Whether an unsubscription of `gri` is pending
    pub fn is_unsubscription_scheduled(&self, gri: &str) -> bool {
        self.lock_scheduled().contains_key(gri)
    }

    /// Unsubscribe right away, cancelling a pending timer
    pub async fn unsubscribe(&self, gri: &str) -> Result<()> {
        self.cancel_scheduled_unsubscription(gri);
        self.send_unsub(gri).await
    }

    fn cancel_scheduled_unsubscription(&self, gri: &str) -> bool {
        match self.lock_scheduled().remove(gri) {
            Some(entry) => {
                entry.timer.abort();
                debug!("Cancelled scheduled unsubscription of {}", gri);
                true
            }
            None => false,
        }
    }

    async fn send_unsub(&self, gri: &str) -> Result<()> {
        let response = self
            .inner
            .channel
            .send(RequestSubtype::Unsub, json!({ "gri": gri }))
            .await?;
        response.into_result()?;
        Ok(())
    }

    fn lock_scheduled(&self) -> MutexGuard<'_, HashMap<String, ScheduledUnsubscription>> {
        self.inner.scheduled.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for GraphService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphService")
            .field("unsubscribe_delay", &self.inner.unsubscribe_delay)
            .finish()
    }
}
