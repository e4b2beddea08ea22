//! Cached records and the entity store collaborator

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A cached backend resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Primary key
    pub gri: String,
    pub model_name: String,
    pub revision: Option<u64>,
    pub is_deleted: bool,
    pub is_forbidden: bool,
    /// Attributes other than `gri` and `revision`
    pub data: Map<String, Value>,
}

impl Record {
    pub fn new(model_name: impl Into<String>, gri: impl Into<String>) -> Self {
        Self {
            gri: gri.into(),
            model_name: model_name.into(),
            revision: None,
            is_deleted: false,
            is_forbidden: false,
            data: Map::new(),
        }
    }

    pub fn with_revision(mut self, revision: u64) -> Self {
        self.revision = Some(revision);
        self
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Whether an update carrying `revision` would be stale for this record
    pub fn rejects_revision(&self, revision: Option<u64>) -> bool {
        if self.is_deleted {
            return true;
        }
        matches!((self.revision, revision), (Some(cached), Some(incoming)) if cached >= incoming)
    }
}

/// Local entity cache the adapter reconciles into
///
/// Records are addressed by model name and GRI.
pub trait EntityStore: Send + Sync {
    fn peek_record(&self, model_name: &str, gri: &str) -> Option<Record>;

    /// Insert a record, or merge its attributes into the cached one
    ///
    /// The cached revision is replaced only by a present one.
    fn push_record(&self, record: Record) -> Record;

    /// Returns false when the record is not cached
    fn set_deleted(&self, model_name: &str, gri: &str, deleted: bool) -> bool;

    /// Returns false when the record is not cached
    fn set_forbidden(&self, model_name: &str, gri: &str, forbidden: bool) -> bool;

    /// Evict a record from the cache
    fn unload_record(&self, model_name: &str, gri: &str) -> Option<Record>;

    fn records_of_model(&self, model_name: &str) -> Vec<Record>;
}

/// In-memory [`EntityStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<(String, String), Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update<F>(&self, model_name: &str, gri: &str, f: F) -> bool
    where
        F: FnOnce(&mut Record),
    {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        match records.get_mut(&(model_name.to_string(), gri.to_string())) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }
}

impl EntityStore for MemoryStore {
    fn peek_record(&self, model_name: &str, gri: &str) -> Option<Record> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(model_name.to_string(), gri.to_string()))
            .cloned()
    }

    fn push_record(&self, record: Record) -> Record {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let key = (record.model_name.clone(), record.gri.clone());
        match records.get_mut(&key) {
            Some(cached) => {
                cached.data.extend(record.data);
                // An update without a revision keeps the known one
                cached.revision = record.revision.or(cached.revision);
                cached.clone()
            }
            None => {
                records.insert(key, record.clone());
                record
            }
        }
    }

    fn set_deleted(&self, model_name: &str, gri: &str, deleted: bool) -> bool {
        self.update(model_name, gri, |record| record.is_deleted = deleted)
    }

    fn set_forbidden(&self, model_name: &str, gri: &str, forbidden: bool) -> bool {
        self.update(model_name, gri, |record| record.is_forbidden = forbidden)
    }

    fn unload_record(&self, model_name: &str, gri: &str) -> Option<Record> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(model_name.to_string(), gri.to_string()))
    }

    fn records_of_model(&self, model_name: &str) -> Vec<Record> {
        let mut records: Vec<Record> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| r.model_name == model_name)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.gri.cmp(&b.gri));
        records
    }
}
