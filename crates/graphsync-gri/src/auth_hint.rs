//! Auth hints
//!
//! An auth hint tells the backend through which related resource a client
//! wants to be authorized, e.g. `throughSpace:abc` to read a user that is a
//! member of space `abc`. The hint kind is derived from the GRI of the
//! "context" collection the requested resource was listed in.

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::GriError;
use crate::gri::decode;

lazy_static! {
    // Collections whose members can be reached "through" the owning entity
    static ref CONTEXT_REGEX: Regex = Regex::new(
        r"^(?:op_)?(?P<model>cluster|harvester|space|group|atm_inventory)\.(?P<id>[^.]+)\.(?:users|groups|spaces|harvesters|eff_providers|providers|children|eff_users|eff_groups|eff_children|owners|instance)(?:[,:].*)?$"
    ).unwrap();
}

/// Hint kind prefix (e.g. `throughSpace`) for a context GRI
///
/// Returns `None` when the GRI is not a collection that can serve as an
/// authorization context.
pub fn auth_hint_prefix(context_gri: &str) -> Option<String> {
    let caps = CONTEXT_REGEX.captures(context_gri)?;
    let mut prefix = String::from("through");
    for part in caps["model"].split('_') {
        let mut chars = part.chars();
        if let Some(first) = chars.next() {
            prefix.push(first.to_ascii_uppercase());
            prefix.push_str(chars.as_str());
        }
    }
    Some(prefix)
}

/// A (hint kind, subject id) pair sent along with a graph request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthHint {
    pub kind: String,
    /// Raw entity id of the subject, not a GRI
    pub subject_id: String,
}

impl AuthHint {
    pub fn new(kind: impl Into<String>, subject_id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            subject_id: subject_id.into(),
        }
    }

    /// Build a hint from an untyped list of parts, which must be exactly
    /// `[kind, subject_id]`
    pub fn from_parts<S: AsRef<str>>(parts: &[S]) -> Result<Self, GriError> {
        match parts {
            [kind, subject_id] => {
                let hint = Self::new(kind.as_ref(), subject_id.as_ref());
                hint.validate()?;
                Ok(hint)
            }
            _ => Err(GriError::InvalidAuthHint(format!(
                "expected 2 parts, got {}",
                parts.len()
            ))),
        }
    }

    /// Derive the hint for reaching a resource through `context_gri`
    pub fn for_context(context_gri: &str) -> Option<Self> {
        let kind = auth_hint_prefix(context_gri)?;
        let subject_id = match decode(context_gri) {
            Ok(gri) => gri.entity_id?,
            Err(_) => CONTEXT_REGEX.captures(context_gri)?["id"].to_string(),
        };
        Some(Self { kind, subject_id })
    }

    /// Parse the `kind:subject` wire form
    pub fn parse_wire(value: &str) -> Result<Self, GriError> {
        let parts: Vec<&str> = value.split(':').collect();
        Self::from_parts(&parts)
    }

    /// Check that both parts are present and the kind cannot be confused with
    /// the wire separator
    pub fn validate(&self) -> Result<(), GriError> {
        if self.kind.is_empty() || self.subject_id.is_empty() {
            return Err(GriError::InvalidAuthHint(format!(
                "empty part in {:?}",
                self
            )));
        }
        if self.kind.contains(':') || self.subject_id.contains(':') {
            return Err(GriError::InvalidAuthHint(format!(
                "separator in {:?}",
                self
            )));
        }
        Ok(())
    }

    /// Wire form: `kind:subject`
    pub fn to_wire(&self) -> String {
        format!("{}:{}", self.kind, self.subject_id)
    }
}

impl fmt::Display for AuthHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.subject_id)
    }
}
