//! Error types for GRI handling

use thiserror::Error;

/// Errors raised while building or parsing identifiers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GriError {
    /// Fields cannot be encoded into a valid GRI
    #[error("Invalid GRI fields: {0}")]
    InvalidGriFields(String),

    /// String does not follow the `TYPE.ID.ASPECT[,ASPECTID][:SCOPE]` grammar
    #[error("Malformed GRI: {0}")]
    MalformedGri(String),

    /// Auth hint is not a (kind, subject id) pair
    #[error("Invalid auth hint: {0}")]
    InvalidAuthHint(String),
}
