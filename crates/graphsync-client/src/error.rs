//! Error types for graphsync-client

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub use graphsync_gri::GriError;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Backend error id used for authorization failures
pub const FORBIDDEN_ERROR_ID: &str = "forbidden";

/// Main error type for client operations
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// Identifier errors (malformed GRI, invalid auth hint)
    #[error(transparent)]
    Gri(#[from] GriError),

    /// Socket and request correlation errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Peer sent something this client does not understand
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Structured error reported by the backend, passed through untouched
    #[error("Backend error: {0}")]
    Backend(BackendError),

    /// Token acquisition errors
    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Local entity store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl SyncError {
    /// True for the recoverable authorization failure
    pub fn is_forbidden(&self) -> bool {
        matches!(self, SyncError::Backend(e) if e.is_forbidden())
    }

    /// Backend error structure, if this error came from the backend
    pub fn backend(&self) -> Option<&BackendError> {
        match self {
            SyncError::Backend(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BackendError> for SyncError {
    fn from(err: BackendError) -> Self {
        SyncError::Backend(err)
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Protocol(ProtocolError::MalformedPayload(err.to_string()))
    }
}

/// Error object as sent by the backend (`{ id, details?, description? }`)
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{id}")]
pub struct BackendError {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl BackendError {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            details: None,
            description: None,
        }
    }

    pub fn forbidden() -> Self {
        Self::new(FORBIDDEN_ERROR_ID)
    }

    pub fn is_forbidden(&self) -> bool {
        self.id == FORBIDDEN_ERROR_ID
    }
}

/// Transport-level errors
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Server answered the handshake with a failure
    #[error("Handshake rejected: {0}")]
    HandshakeRejected(BackendError),

    /// Authenticated session requested but the server granted an anonymous one
    #[error("Handshake granted the nobody identity")]
    NobodyIdentity,

    /// Writing the frame to the socket failed
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Generated correlation id is already pending
    #[error("Message id collision: {0}")]
    UuidCollision(Uuid),

    /// Connection closed while the request was pending
    #[error("Connection closed")]
    ConnectionClosed,

    /// Socket could not be opened
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Socket is already connecting or open
    #[error("Already connected")]
    AlreadyConnected,

    /// Inbound frame is not valid JSON or not an envelope
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

/// Protocol-level errors; they indicate client/server version skew
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("Unsupported push update type: {0}")]
    UnsupportedUpdateType(String),

    #[error("Unsupported nosub reason: {0}")]
    UnsupportedNosubReason(String),

    #[error("No handler for message type: {0}")]
    UnknownMessageType(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}

/// Token acquisition errors
#[derive(Error, Debug, Clone)]
pub enum TokenError {
    /// Login provider answered 401
    #[error("Unauthorized")]
    Unauthorized,

    /// Token was not obtained within the configured time
    #[error("Token get timeout after {0} ms")]
    Timeout(u64),

    #[error("Token fetch failed: {0}")]
    Failed(String),
}

/// Configuration errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Entity store errors
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Resource payload has no usable primary key
    #[error("Resource without gri: {0}")]
    MissingGri(String),

    /// Resource payload is not a JSON object
    #[error("Resource is not an object: {0}")]
    NotAnObject(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}
