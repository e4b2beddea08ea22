//! GRI to model name bookkeeping

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use graphsync_gri::decode;

/// Remembers which model every fetched GRI was loaded as
#[derive(Debug, Clone, Default)]
pub struct RecordRegistry {
    models: Arc<RwLock<HashMap<String, String>>>,
}

impl RecordRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_id(&self, gri: &str, model_name: &str) {
        self.models
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(gri.to_string(), model_name.to_string());
    }

    pub fn get_model_name(&self, gri: &str) -> Option<String> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(gri)
            .cloned()
    }

    pub fn remove(&self, gri: &str) -> Option<String> {
        self.models
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(gri)
    }
}

/// Entity type <-> model name mapping with configured overrides
#[derive(Debug, Clone, Default)]
pub struct ModelNames {
    entity_type_to_model: HashMap<String, String>,
    model_to_entity_type: HashMap<String, String>,
}

impl ModelNames {
    pub fn new(overrides: HashMap<String, String>) -> Self {
        let model_to_entity_type = overrides
            .iter()
            .map(|(entity_type, model)| (model.clone(), entity_type.clone()))
            .collect();
        Self {
            entity_type_to_model: overrides,
            model_to_entity_type,
        }
    }

    /// Model name for an entity type, the entity type itself by default
    pub fn model_for_entity_type(&self, entity_type: &str) -> String {
        self.entity_type_to_model
            .get(entity_type)
            .cloned()
            .unwrap_or_else(|| entity_type.to_string())
    }

    /// Entity type for a model name, its snake_case form by default
    pub fn entity_type_for_model(&self, model_name: &str) -> String {
        self.model_to_entity_type
            .get(model_name)
            .cloned()
            .unwrap_or_else(|| model_name.replace('-', "_"))
    }

    /// Model of a pushed GRI: the registered one, else derived from its
    /// entity type
    pub fn resolve(&self, registry: &RecordRegistry, gri: &str) -> Option<String> {
        registry.get_model_name(gri).or_else(|| {
            decode(gri)
                .ok()
                .map(|parsed| self.model_for_entity_type(&parsed.entity_type))
        })
    }
}
