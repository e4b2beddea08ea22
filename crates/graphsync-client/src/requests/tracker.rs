//! Registry of in-flight backend requests

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

/// Suffix of collection model names (`space-list` lists `space` records)
pub const LIST_MODEL_SUFFIX: &str = "-list";

/// Kind of an in-flight request; each kind has its own bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Create,
    Fetch,
    Update,
    Delete,
    Rpc,
    Graph,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Create => "create",
            RequestKind::Fetch => "fetch",
            RequestKind::Update => "update",
            RequestKind::Delete => "delete",
            RequestKind::Rpc => "rpc",
            RequestKind::Graph => "graph",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a request is about
#[derive(Debug, Clone, PartialEq)]
pub struct RequestInfo {
    pub kind: RequestKind,
    /// Only in CRUD requests
    pub model_name: Option<String>,
    /// Only in CRUD requests
    pub entity_id: Option<String>,
    /// Only in RPC requests
    pub rpc_method: Option<String>,
    /// Record body, RPC args or the whole graph request
    pub payload: Option<Value>,
}

impl RequestInfo {
    pub fn new(kind: RequestKind) -> Self {
        Self {
            kind,
            model_name: None,
            entity_id: None,
            rpc_method: None,
            payload: None,
        }
    }

    /// CRUD request on a record of `model_name`
    pub fn crud(kind: RequestKind, model_name: impl Into<String>, entity_id: Option<String>) -> Self {
        Self {
            model_name: Some(model_name.into()),
            entity_id,
            ..Self::new(kind)
        }
    }

    pub fn rpc(method: impl Into<String>, args: Value) -> Self {
        Self {
            rpc_method: Some(method.into()),
            payload: Some(args),
            ..Self::new(RequestKind::Rpc)
        }
    }

    pub fn graph(request: Value) -> Self {
        Self {
            payload: Some(request),
            ..Self::new(RequestKind::Graph)
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Snapshot of one in-flight request
#[derive(Debug, Clone)]
pub struct ActiveRequest {
    pub id: u64,
    pub info: RequestInfo,
    settled: watch::Receiver<bool>,
}

impl ActiveRequest {
    pub fn kind(&self) -> RequestKind {
        self.info.kind
    }

    pub fn model_name(&self) -> Option<&str> {
        self.info.model_name.as_deref()
    }

    pub fn is_settled(&self) -> bool {
        *self.settled.borrow()
    }

    /// Wait until the request settles, successfully or not
    pub async fn wait(&self) {
        let mut settled = self.settled.clone();
        // A dropped sender means the request is gone as well
        let _ = settled.wait_for(|done| *done).await;
    }
}

#[derive(Default)]
struct Buckets {
    by_kind: HashMap<RequestKind, Vec<ActiveRequest>>,
}

/// In-flight requests partitioned by kind
#[derive(Clone, Default)]
pub struct ActiveRequestTracker {
    buckets: Arc<Mutex<Buckets>>,
    next_id: Arc<AtomicU64>,
}

/// Keeps a request in its bucket; dropping it settles the request
pub struct RequestGuard {
    tracker: ActiveRequestTracker,
    id: u64,
    kind: RequestKind,
    settled: watch::Sender<bool>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.tracker.remove(self.kind, self.id);
        self.settled.send_replace(true);
    }
}

impl ActiveRequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a request into its bucket until the returned guard is dropped
    pub fn add_request(&self, info: RequestInfo) -> RequestGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let kind = info.kind;
        let (settled, receiver) = watch::channel(false);
        tracing::trace!("Active {} request #{}", kind, id);
        self.lock()
            .by_kind
            .entry(kind)
            .or_default()
            .push(ActiveRequest {
                id,
                info,
                settled: receiver,
            });
        RequestGuard {
            tracker: self.clone(),
            id,
            kind,
            settled,
        }
    }

    /// Run `future` as a tracked request
    ///
    /// The request leaves its bucket when the future completes, fails or is
    /// dropped.
    pub async fn track<F, T>(&self, info: RequestInfo, future: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.add_request(info);
        future.await
    }

    /// Like [`track`](Self::track), but `future` only starts once every
    /// request blocking it has settled
    ///
    /// Blockers are collected before this request enters its bucket, so two
    /// requests never wait for each other.
    pub async fn track_after_blocking<F, T>(&self, info: RequestInfo, future: F) -> T
    where
        F: Future<Output = T>,
    {
        let blocking = match info.model_name.as_deref() {
            Some(model_name) => self.find_blocking_requests(info.kind, model_name),
            None => Vec::new(),
        };
        let _guard = self.add_request(info);
        if !blocking.is_empty() {
            tracing::debug!("Request waits for {} blocking request(s)", blocking.len());
            join_all(blocking.iter().map(ActiveRequest::wait)).await;
        }
        future.await
    }

    /// In-flight requests of one kind, oldest first
    pub fn requests(&self, kind: RequestKind) -> Vec<ActiveRequest> {
        self.lock().by_kind.get(&kind).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().by_kind.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Requests that must settle before `operation` on `model_name` starts
    ///
    /// - creating a record waits for fetches of its `-list` collection
    /// - fetching a collection waits for creates and deletes of its members
    /// - other operations have no prerequisites
    pub fn find_blocking_requests(&self, operation: RequestKind, model_name: &str) -> Vec<ActiveRequest> {
        let buckets = self.lock();
        let of_model = |kind: RequestKind, model: &str| -> Vec<ActiveRequest> {
            buckets
                .by_kind
                .get(&kind)
                .map(|bucket| {
                    bucket
                        .iter()
                        .filter(|r| r.model_name() == Some(model))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        match operation {
            RequestKind::Create if !model_name.ends_with(LIST_MODEL_SUFFIX) => {
                of_model(RequestKind::Fetch, &format!("{}{}", model_name, LIST_MODEL_SUFFIX))
            }
            RequestKind::Fetch => match model_name.strip_suffix(LIST_MODEL_SUFFIX) {
                Some(entry_model) => {
                    let mut blocking = of_model(RequestKind::Create, entry_model);
                    blocking.extend(of_model(RequestKind::Delete, entry_model));
                    blocking
                }
                None => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    /// Wait for every request blocking `operation` on `model_name`
    pub async fn wait_for_blocking(&self, operation: RequestKind, model_name: &str) {
        let blocking = self.find_blocking_requests(operation, model_name);
        if blocking.is_empty() {
            return;
        }
        tracing::debug!(
            "{} of {} waits for {} request(s)",
            operation,
            model_name,
            blocking.len()
        );
        join_all(blocking.iter().map(ActiveRequest::wait)).await;
    }

    fn remove(&self, kind: RequestKind, id: u64) {
        let mut buckets = self.lock();
        if let Some(bucket) = buckets.by_kind.get_mut(&kind) {
            bucket.retain(|r| r.id != id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Buckets> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ActiveRequestTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveRequestTracker")
            .field("active", &self.len())
            .finish()
    }
}
