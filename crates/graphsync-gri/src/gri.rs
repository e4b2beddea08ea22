//! GRI encoding and decoding
//!
//! Canonical form: `entityType.entityId.aspect[,aspectId]:scope`. The entity id
//! is the literal `null` for aspects that are not bound to one entity.

use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::GriError;

/// Placeholder used in the entity id position for type-scoped aspects
pub const NULL_ENTITY_ID: &str = "null";

lazy_static! {
    // TYPE.ID.ASPECT[,ASPECTID][:SCOPE]
    static ref GRI_REGEX: Regex = Regex::new(
        r"^(?P<type>[^.,:]+)\.(?P<id>[^.,:]+)\.(?P<aspect>[^.,:]+)(?:,(?P<aspect_id>[^:]+))?(?::(?P<scope>[^.,:]+))?$"
    ).unwrap();
}

/// Visibility scope of a resource aspect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Private,
    Protected,
    Shared,
    Public,
    Auto,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Private => "private",
            Scope::Protected => "protected",
            Scope::Shared => "shared",
            Scope::Public => "public",
            Scope::Auto => "auto",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = GriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(Scope::Private),
            "protected" => Ok(Scope::Protected),
            "shared" => Ok(Scope::Shared),
            "public" => Ok(Scope::Public),
            "auto" => Ok(Scope::Auto),
            other => Err(GriError::InvalidGriFields(format!("unknown scope: {}", other))),
        }
    }
}

/// Structured form of a Graph Resource Identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gri {
    pub entity_type: String,
    /// `None` for aspects that are not entity-scoped (encoded as `null`)
    pub entity_id: Option<String>,
    pub aspect: String,
    pub aspect_id: Option<String>,
    /// `None` only for legacy strings without the `:scope` suffix
    pub scope: Option<Scope>,
}

impl Gri {
    /// Create a GRI without aspect id and with the default scope
    pub fn new(entity_type: impl Into<String>, entity_id: Option<&str>, aspect: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.map(str::to_string),
            aspect: aspect.into(),
            aspect_id: None,
            scope: None,
        }
    }

    /// Shorthand for the `instance` aspect of an entity
    pub fn instance(entity_type: impl Into<String>, entity_id: &str, scope: Scope) -> Self {
        Self::new(entity_type, Some(entity_id), "instance").with_scope(scope)
    }

    pub fn with_aspect_id(mut self, aspect_id: impl Into<String>) -> Self {
        self.aspect_id = Some(aspect_id.into());
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Scope that will be written by `encode` (`private` when unset)
    pub fn effective_scope(&self) -> Scope {
        self.scope.unwrap_or_default()
    }

    /// Encode into the canonical string form
    pub fn encode(&self) -> Result<String, GriError> {
        encode(self)
    }
}

impl FromStr for Gri {
    type Err = GriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode(s)
    }
}

/// Encode GRI fields into `TYPE.ID.ASPECT[,ASPECTID]:SCOPE`
///
/// `entity_id: None` is written as `null`, the aspect id segment is omitted when
/// absent and a missing scope defaults to `private`.
pub fn encode(fields: &Gri) -> Result<String, GriError> {
    check_segment("entityType", &fields.entity_type, &['.', ',', ':'])?;
    check_segment("aspect", &fields.aspect, &['.', ',', ':'])?;
    if let Some(ref entity_id) = fields.entity_id {
        check_segment("entityId", entity_id, &['.', ',', ':'])?;
    }
    if let Some(ref aspect_id) = fields.aspect_id {
        check_segment("aspectId", aspect_id, &[':'])?;
    }

    let entity_id = fields.entity_id.as_deref().unwrap_or(NULL_ENTITY_ID);
    let mut gri = format!("{}.{}.{}", fields.entity_type, entity_id, fields.aspect);
    if let Some(ref aspect_id) = fields.aspect_id {
        gri.push(',');
        gri.push_str(aspect_id);
    }
    gri.push(':');
    gri.push_str(fields.effective_scope().as_str());
    Ok(gri)
}

/// Decode a GRI string into its fields
pub fn decode(gri: &str) -> Result<Gri, GriError> {
    let caps = GRI_REGEX
        .captures(gri)
        .ok_or_else(|| GriError::MalformedGri(gri.to_string()))?;

    let scope = match caps.name("scope") {
        Some(m) => Some(
            m.as_str()
                .parse::<Scope>()
                .map_err(|_| GriError::MalformedGri(gri.to_string()))?,
        ),
        None => None,
    };
    let entity_id = match &caps["id"] {
        NULL_ENTITY_ID => None,
        id => Some(id.to_string()),
    };

    Ok(Gri {
        entity_type: caps["type"].to_string(),
        entity_id,
        aspect: caps["aspect"].to_string(),
        aspect_id: caps.name("aspect_id").map(|m| m.as_str().to_string()),
        scope,
    })
}

fn check_segment(name: &str, value: &str, forbidden: &[char]) -> Result<(), GriError> {
    if value.is_empty() {
        return Err(GriError::InvalidGriFields(format!("{} must not be empty", name)));
    }
    if let Some(c) = value.chars().find(|c| forbidden.contains(c)) {
        return Err(GriError::InvalidGriFields(format!(
            "{} must not contain '{}': {}",
            name, c, value
        )));
    }
    Ok(())
}
