//! Wire payload <-> record conversion

use serde_json::{Map, Value};

use crate::context::ContextRegistry;
use crate::error::{Result, StoreError};
use crate::store::Record;

/// Key of the member GRI array in collection resources
pub const LIST_KEY: &str = "list";

/// Turns resources into records and registers collection contexts
#[derive(Debug, Clone)]
pub struct Serializer {
    contexts: ContextRegistry,
}

impl Serializer {
    pub fn new(contexts: ContextRegistry) -> Self {
        Self { contexts }
    }

    /// Normalize a resource into a record of `model_name`
    ///
    /// `gri` is the primary key; `revision` is optional. Members of a
    /// collection (`list`) get the collection as their context.
    pub fn normalize(&self, model_name: &str, resource: Value) -> Result<Record> {
        let mut data = match resource {
            Value::Object(data) => data,
            other => return Err(StoreError::NotAnObject(other.to_string()).into()),
        };
        let gri = match data.remove("gri") {
            Some(Value::String(gri)) if !gri.is_empty() => gri,
            _ => return Err(StoreError::MissingGri(model_name.to_string()).into()),
        };
        let revision = data.remove("revision").and_then(|r| r.as_u64());

        if let Some(Value::Array(list)) = data.get(LIST_KEY) {
            let members: Vec<String> = list
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
            self.contexts.register_array(&members, &gri, Some(&gri), true);
        }

        Ok(Record {
            gri,
            model_name: model_name.to_string(),
            revision,
            is_deleted: false,
            is_forbidden: false,
            data,
        })
    }
}

/// Remove top-level null attributes from an outbound payload
pub fn strip_nulls(data: Value) -> Value {
    match data {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .collect::<Map<String, Value>>(),
        ),
        other => other,
    }
}
