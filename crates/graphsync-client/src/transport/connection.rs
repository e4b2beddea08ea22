//! Connection lifecycle types and handshake data

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identity the server grants to anonymous sessions
pub const NOBODY_IDENTITY: &str = "nobody";

/// Lifecycle of the single connection owned by a transport channel
///
/// `Idle → Connecting → Open → Closing → Idle`, with `Errored` reachable
/// from `Connecting` and `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Errored,
}

impl ConnectionState {
    /// Whether a new connection may be started from this state
    pub fn can_connect(&self) -> bool {
        matches!(self, ConnectionState::Idle | ConnectionState::Errored)
    }
}

/// Options of a single `connect` call
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Bearer token sent as `auth.macaroon`
    pub token: Option<String>,
    /// Overrides the configured default protocol version
    pub protocol_version: Option<u32>,
    /// Fail with `NobodyIdentity` if the server grants an anonymous session
    pub require_identity: bool,
}

impl ConnectOptions {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Self::default()
        }
    }

    pub fn authenticated(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            require_identity: true,
            ..Self::default()
        }
    }
}

/// Server-declared attributes sent in a successful handshake
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_build_version: Option<String>,
    /// Backend "now" at handshake time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_time_seconds: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `data` of a successful handshake response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeData {
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub identity: Value,
    #[serde(default)]
    pub attributes: ConnectionAttributes,
}

impl HandshakeData {
    /// Anonymous session
    pub fn is_nobody(&self) -> bool {
        self.identity.as_str() == Some(NOBODY_IDENTITY)
    }
}

/// Attributes of the current connection, captured at handshake time
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub attributes: ConnectionAttributes,
    pub identity: Value,
    /// Backend time minus local time; positive when the backend is ahead
    pub global_time_seconds_offset: i64,
    pub connected_at: DateTime<Utc>,
}

impl ConnectionInfo {
    pub fn from_handshake(data: &HandshakeData, now: DateTime<Utc>) -> Self {
        let local = now.timestamp();
        let global = data.attributes.global_time_seconds.unwrap_or(local);
        Self {
            attributes: data.attributes.clone(),
            identity: data.identity.clone(),
            global_time_seconds_offset: global - local,
            connected_at: now,
        }
    }

    pub fn service_version(&self) -> Option<&str> {
        self.attributes.service_version.as_deref()
    }

    /// Current backend time estimated from the handshake offset
    pub fn global_now_seconds(&self) -> i64 {
        Utc::now().timestamp() + self.global_time_seconds_offset
    }
}
