//! Graph Resource Identifiers for GraphSync clients
//!
//! This crate provides the pure, stateless pieces of the GraphSync addressing
//! scheme:
//! - GRI encoding and decoding (`TYPE.ID.ASPECT[,ASPECTID]:SCOPE`)
//! - The closed set of resource scopes
//! - Auth hint derivation from "context" collection GRIs
//!   (e.g. `space.abc.users` yields `throughSpace:abc`)

pub mod auth_hint;
pub mod error;
pub mod gri;

pub use auth_hint::{auth_hint_prefix, AuthHint};
pub use error::GriError;
pub use gri::{decode, encode, Gri, Scope, NULL_ENTITY_ID};
