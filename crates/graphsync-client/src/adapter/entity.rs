//! Entity adapter
//!
//! Mediates between the local entity store and the graph service: CRUD
//! operations, forbidden-fetch recovery through authorization contexts and
//! reconciliation of pushed updates.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use futures_util::future::join_all;
use graphsync_gri::{decode, AuthHint, Gri, Scope};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::events::RecordEvent;
use super::serializer::{strip_nulls, Serializer, LIST_KEY};
use crate::context::ContextRegistry;
use crate::error::{ProtocolError, Result, SyncError};
use crate::graph::{GraphEvent, GraphEventListener, GraphRequest, GraphResult, GraphService};
use crate::requests::{ActiveRequestTracker, RequestInfo, RequestKind, LIST_MODEL_SUFFIX};
use crate::store::{EntityStore, ModelNames, Record, RecordRegistry};

const EVENT_CAPACITY: usize = 256;

/// Adapter behavior settings
#[derive(Debug, Clone)]
pub struct AdapterOptions {
    /// Scope of the GRI used to create records
    pub default_create_scope: Scope,
    /// After all contexts fail, try once more without a hint if the first
    /// attempt had one
    pub retry_without_hint: bool,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            default_create_scope: Scope::Auto,
            retry_without_hint: true,
        }
    }
}

/// Options of a single fetch
#[derive(Debug, Clone)]
pub struct FindOptions {
    /// Used instead of the registered contexts for the first attempt
    pub auth_hint: Option<AuthHint>,
    pub subscribe: bool,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            auth_hint: None,
            subscribe: true,
        }
    }
}

struct AdapterInner {
    graph: GraphService,
    contexts: ContextRegistry,
    tracker: ActiveRequestTracker,
    store: Arc<dyn EntityStore>,
    records: RecordRegistry,
    models: ModelNames,
    serializer: Serializer,
    options: AdapterOptions,
    events: broadcast::Sender<RecordEvent>,
}

/// Entity adapter of one session
#[derive(Clone)]
pub struct EntityAdapter {
    inner: Arc<AdapterInner>,
}

impl EntityAdapter {
    /// Create the adapter and subscribe it to the graph service's pushes
    pub fn new(
        graph: GraphService,
        contexts: ContextRegistry,
        store: Arc<dyn EntityStore>,
        models: ModelNames,
        options: AdapterOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(AdapterInner {
            tracker: graph.tracker().clone(),
            serializer: Serializer::new(contexts.clone()),
            graph,
            contexts,
            store,
            records: RecordRegistry::new(),
            models,
            options,
            events,
        });
        let weak = Arc::downgrade(&inner);
        let listener: Weak<dyn GraphEventListener> = weak;
        inner.graph.add_listener(listener);
        Self { inner }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.inner.store
    }

    pub fn records(&self) -> &RecordRegistry {
        &self.inner.records
    }

    pub fn model_names(&self) -> &ModelNames {
        &self.inner.models
    }

    /// Receive record change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<RecordEvent> {
        self.inner.events.subscribe()
    }

    /// GRI of a user record
    pub fn user_gri(&self, user_id: &str) -> Result<String> {
        let entity_type = self.inner.models.entity_type_for_model("user");
        Ok(Gri::instance(entity_type, user_id, Scope::Auto).encode()?)
    }

    /// Fetch a record, recovering from `forbidden` through known contexts
    ///
    /// The record is marked forbidden only once every context failed; the
    /// original `forbidden` error is returned then.
    pub async fn find_record(&self, model_name: &str, gri: &str, options: FindOptions) -> Result<Record> {
        let info = RequestInfo::crud(RequestKind::Fetch, model_name, entity_id_of(gri));
        self.inner
            .tracker
            .track_after_blocking(info, async {
                let resource = self.fetch_resource(gri, options.auth_hint.clone(), options.subscribe).await;
                match resource {
                    Ok(resource) => {
                        debug!("findRecord {} returned {}", gri, resource);
                        self.apply_resource(model_name, resource)
                    }
                    Err(e) => {
                        if e.is_forbidden() {
                            self.mark_forbidden(model_name, gri);
                        }
                        Err(e)
                    }
                }
            })
            .await
    }

    /// Create a record of `model_name` with the given attributes
    pub async fn create_record(
        &self,
        model_name: &str,
        data: Value,
        auth_hint: Option<AuthHint>,
    ) -> Result<Record> {
        let entity_type = self.inner.models.entity_type_for_model(model_name);
        let gri = Gri::new(entity_type, None, "instance")
            .with_scope(self.inner.options.default_create_scope)
            .encode()?;
        let data = strip_nulls(data);
        let info = RequestInfo::crud(RequestKind::Create, model_name, None).with_payload(data.clone());

        self.inner
            .tracker
            .track_after_blocking(info, async {
                let request = GraphRequest::create(gri, data).with_auth_hint(auth_hint);
                let resource = self
                    .inner
                    .graph
                    .request(request)
                    .await?
                    .into_resource()
                    .ok_or_else(|| {
                        ProtocolError::MalformedPayload(format!("create of {} returned no resource", model_name))
                    })?;
                self.apply_resource(model_name, resource)
            })
            .await
    }

    /// Update a record; the request always targets the private scope
    ///
    /// Returns the cached record after the update, if it is cached.
    pub async fn update_record(&self, model_name: &str, gri: &str, data: Value) -> Result<Option<Record>> {
        let target = private_gri(gri)?;
        let data = strip_nulls(data);
        let info = RequestInfo::crud(RequestKind::Update, model_name, entity_id_of(gri)).with_payload(data.clone());

        self.inner
            .tracker
            .track_after_blocking(info, async {
                let result = self
                    .inner
                    .graph
                    .request(GraphRequest::update(target, data.clone()))
                    .await?;
                match result {
                    GraphResult::Resource(resource) => self.apply_resource(model_name, resource).map(Some),
                    _ => Ok(self.merge_local(model_name, gri, data)),
                }
            })
            .await
    }

    /// Delete a record; the request always targets the private scope
    pub async fn delete_record(&self, model_name: &str, gri: &str) -> Result<()> {
        let target = private_gri(gri)?;
        let info = RequestInfo::crud(RequestKind::Delete, model_name, entity_id_of(gri));

        self.inner
            .tracker
            .track_after_blocking(info, async {
                self.inner.graph.request(GraphRequest::delete(target)).await?;
                if self.inner.store.set_deleted(model_name, gri, true) {
                    self.emit(RecordEvent::Deleted {
                        model_name: model_name.to_string(),
                        gri: gri.to_string(),
                    });
                }
                self.drop_contexts(gri);
                Ok::<_, SyncError>(())
            })
            .await?;

        // Runs after the delete left the tracker; list fetches wait for it
        if let Some(entity_id) = entity_id_of(gri) {
            if let Err(e) = self.recalculate_lists_with_entity(model_name, &entity_id).await {
                warn!("Reloading lists after deleting {} failed: {}", gri, e);
            }
        }
        Ok(())
    }

    /// Reload every cached `<model>-list` record listing `entity_id`
    ///
    /// Forbidden and deleted lists are skipped. Returns the GRIs of the
    /// reloaded lists; the first failed reload fails the whole call.
    pub async fn recalculate_lists_with_entity(&self, model_name: &str, entity_id: &str) -> Result<Vec<String>> {
        let list_model = format!("{}{}", model_name, LIST_MODEL_SUFFIX);
        let lists: Vec<String> = self
            .inner
            .store
            .records_of_model(&list_model)
            .into_iter()
            .filter(|list| !list.is_forbidden && !list.is_deleted && lists_entity(list, entity_id))
            .map(|list| list.gri)
            .collect();
        if lists.is_empty() {
            return Ok(lists);
        }

        debug!("Reloading {} {} record(s) listing {}", lists.len(), list_model, entity_id);
        let reloads = lists
            .iter()
            .map(|gri| self.find_record(&list_model, gri, FindOptions::default()));
        join_all(reloads)
            .await
            .into_iter()
            .collect::<Result<Vec<Record>>>()?;
        Ok(lists)
    }

    /// Evict a record, schedule its unsubscription and drop its contexts
    pub fn unload_record(&self, model_name: &str, gri: &str) -> Option<Record> {
        let record = self.inner.store.unload_record(model_name, gri);
        self.inner.graph.schedule_unsubscription(gri);
        self.drop_contexts(gri);
        self.inner.records.remove(gri);
        record
    }

    /// Apply an `updated` push
    ///
    /// Returns `None` when the update is stale: the cached record is deleted
    /// or already has the same or a newer revision.
    pub fn push_updated(&self, gri: &str, data: Value) -> Result<Option<Record>> {
        let model_name = self.resolve_model(gri)?;
        let mut data = data;
        if let Value::Object(ref mut map) = data {
            map.entry("gri").or_insert_with(|| Value::String(gri.to_string()));
        }

        // Checked before normalizing so a stale collection leaves contexts alone
        let revision = data.get("revision").and_then(Value::as_u64);
        if let Some(cached) = self.inner.store.peek_record(&model_name, gri) {
            if cached.rejects_revision(revision) {
                warn!(
                    "Ignoring stale push for {} (cached revision {:?}, incoming {:?}, deleted: {})",
                    gri, cached.revision, revision, cached.is_deleted
                );
                return Ok(None);
            }
        }
        let incoming = self.inner.serializer.normalize(&model_name, data)?;
        self.store_record(incoming).map(Some)
    }

    /// Apply a `deleted` push; the record stays cached, marked deleted
    pub fn push_deleted(&self, gri: &str) -> Result<bool> {
        let model_name = self.resolve_model(gri)?;
        match self.inner.store.peek_record(&model_name, gri) {
            Some(record) if !record.is_deleted => {
                self.inner.store.set_deleted(&model_name, gri, true);
                self.emit(RecordEvent::Deleted {
                    model_name,
                    gri: gri.to_string(),
                });
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Handle a `forbidden` nosub: drop the failed context and try to reach
    /// the record another way
    pub async fn push_forbidden(&self, gri: &str, auth_hint: Option<AuthHint>) -> Result<Option<Record>> {
        match auth_hint {
            Some(ref hint) => {
                self.inner.contexts.deregister_hint(hint, gri);
            }
            None => self.inner.contexts.deregister(gri, None, None),
        }

        let model_name = self.resolve_model(gri)?;
        match self.fetch_resource(gri, None, true).await {
            Ok(resource) => self.push_updated(gri, resource),
            Err(e) if e.is_forbidden() => {
                self.mark_forbidden(&model_name, gri);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch with context resolution
    ///
    /// Contexts are tried most recent first; each one answering `forbidden`
    /// is deregistered. Any other error ends the chain.
    async fn fetch_resource(&self, gri: &str, explicit_hint: Option<AuthHint>, subscribe: bool) -> Result<Value> {
        let contexts = &self.inner.contexts;
        let mut context = match explicit_hint {
            Some(_) => None,
            None => contexts.get_context(gri),
        };
        let mut hint = explicit_hint.or_else(|| context.as_deref().and_then(AuthHint::for_context));
        let mut hintless_tried = hint.is_none();
        let mut tried: HashSet<String> = HashSet::new();
        let mut first_forbidden: Option<SyncError> = None;

        loop {
            let request = GraphRequest::get(gri)
                .with_auth_hint(hint.clone())
                .with_subscribe(subscribe);
            let error = match self.inner.graph.request(request).await {
                Ok(result) => {
                    return result.into_resource().ok_or_else(|| {
                        ProtocolError::MalformedPayload(format!("get of {} returned no resource", gri)).into()
                    })
                }
                Err(e) if e.is_forbidden() => e,
                Err(e) => return Err(e),
            };
            debug!("Fetching {} with auth hint {:?} is forbidden", gri, hint);
            let first = first_forbidden.get_or_insert(error).clone();

            if let Some(failed) = context.take() {
                contexts.deregister(&failed, None, Some(gri));
                tried.insert(failed);
            }

            // Skip contexts re-registered after they already failed
            let next = loop {
                match contexts.get_context(gri) {
                    Some(candidate) if tried.contains(&candidate) => {
                        contexts.deregister(&candidate, None, Some(gri));
                    }
                    other => break other,
                }
            };

            match next {
                Some(next) => {
                    hint = AuthHint::for_context(&next);
                    context = Some(next);
                }
                None if !hintless_tried && self.inner.options.retry_without_hint => {
                    hint = None;
                    hintless_tried = true;
                }
                None => return Err(first),
            }
        }
    }

    fn apply_resource(&self, model_name: &str, resource: Value) -> Result<Record> {
        let record = self.inner.serializer.normalize(model_name, resource)?;
        self.store_record(record)
    }

    fn store_record(&self, record: Record) -> Result<Record> {
        let model_name = record.model_name.clone();
        let gri = record.gri.clone();
        self.inner.records.register_id(&gri, &model_name);
        let stored = self.inner.store.push_record(record);

        if stored.is_forbidden {
            self.inner.store.set_forbidden(&model_name, &gri, false);
            self.emit(RecordEvent::ForbiddenChanged {
                model_name: model_name.clone(),
                gri: gri.clone(),
                forbidden: false,
            });
        }
        self.emit(RecordEvent::Reloaded {
            model_name: model_name.clone(),
            gri: gri.clone(),
        });
        Ok(self.inner.store.peek_record(&model_name, &gri).unwrap_or(stored))
    }

    fn merge_local(&self, model_name: &str, gri: &str, data: Value) -> Option<Record> {
        let cached = self.inner.store.peek_record(model_name, gri)?;
        let attributes = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let revision = cached.revision;
        let mut update = Record::new(model_name, gri).with_data(attributes);
        update.revision = revision;
        Some(self.inner.store.push_record(update))
    }

    fn mark_forbidden(&self, model_name: &str, gri: &str) {
        let already = self
            .inner
            .store
            .peek_record(model_name, gri)
            .map(|r| r.is_forbidden)
            .unwrap_or(false);
        if already {
            return;
        }
        if !self.inner.store.set_forbidden(model_name, gri, true) {
            let mut placeholder = Record::new(model_name, gri);
            placeholder.is_forbidden = true;
            self.inner.store.push_record(placeholder);
            self.inner.records.register_id(gri, model_name);
        }
        self.emit(RecordEvent::ForbiddenChanged {
            model_name: model_name.to_string(),
            gri: gri.to_string(),
            forbidden: true,
        });
    }

    fn drop_contexts(&self, gri: &str) {
        self.inner.contexts.forget(gri);
        self.inner.contexts.deregister(gri, Some(gri), None);
    }

    fn resolve_model(&self, gri: &str) -> Result<String> {
        self.inner
            .models
            .resolve(&self.inner.records, gri)
            .ok_or_else(|| ProtocolError::MalformedPayload(format!("cannot resolve model of {}", gri)).into())
    }

    fn emit(&self, event: RecordEvent) {
        // No receivers is fine
        let _ = self.inner.events.send(event);
    }
}

impl GraphEventListener for AdapterInner {
    fn on_graph_event(self: Arc<Self>, event: GraphEvent) -> Result<()> {
        let adapter = EntityAdapter { inner: self };
        match event {
            GraphEvent::Updated { gri, data } => adapter.push_updated(&gri, data).map(|_| ()),
            GraphEvent::Deleted { gri } => adapter.push_deleted(&gri).map(|_| ()),
            GraphEvent::Forbidden { gri, auth_hint } => {
                tokio::spawn(async move {
                    if let Err(e) = adapter.push_forbidden(&gri, auth_hint).await {
                        warn!("Recovering {} after forbidden push failed: {}", gri, e);
                    }
                });
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for EntityAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityAdapter")
            .field("options", &self.inner.options)
            .finish()
    }
}

fn private_gri(gri: &str) -> Result<String> {
    Ok(decode(gri)?.with_scope(Scope::Private).encode()?)
}

fn entity_id_of(gri: &str) -> Option<String> {
    decode(gri).ok().and_then(|parsed| parsed.entity_id)
}

fn lists_entity(list: &Record, entity_id: &str) -> bool {
    list.get(LIST_KEY)
        .and_then(Value::as_array)
        .is_some_and(|members| {
            members
                .iter()
                .filter_map(Value::as_str)
                .any(|member| entity_id_of(member).as_deref() == Some(entity_id))
        })
}
