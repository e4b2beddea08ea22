//! Configuration for graphsync-client
//!
//! Centralized configuration for the endpoint, protocol negotiation,
//! subscription timing and authorization behavior.
//!
//! ```toml
//! [endpoint]
//! api_origin = "onezone.example.com"
//! secure = true
//!
//! [protocol]
//! default_version = 3
//!
//! [graph]
//! unsubscribe_delay_ms = 5000
//! default_create_scope = "auto"
//!
//! [models.entity_type_to_model]
//! atm_inventory = "atm-inventory"
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use graphsync_gri::Scope;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

/// Client-wide configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Where the GraphSync endpoint lives
    pub endpoint: EndpointConfig,
    /// Handshake settings
    pub protocol: ProtocolConfig,
    /// Graph request and subscription settings
    pub graph: GraphConfig,
    /// Token and reconnection settings
    pub auth: AuthConfig,
    /// Authorization context resolution settings
    pub context: ContextConfig,
    /// Entity type / model name overrides
    pub models: ModelConfig,
}

/// Endpoint location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Host with optional port, without scheme
    pub api_origin: String,
    /// Use `wss://` instead of `ws://`
    pub secure: bool,
    /// Path of the GraphSync socket
    pub path: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            api_origin: "localhost".to_string(),
            secure: true,
            path: "/graph_sync/gui".to_string(),
        }
    }
}

/// Protocol negotiation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Version offered in `supportedVersions` when the caller does not pick one
    pub default_version: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self { default_version: 3 }
    }
}

/// Graph request settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Debounce before a scheduled unsubscription is sent
    pub unsubscribe_delay_ms: u64,
    /// Scope used in GRIs of newly created records
    pub default_create_scope: Scope,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            unsubscribe_delay_ms: 5000,
            default_create_scope: Scope::Auto,
        }
    }
}

/// Token and connection recovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Max time to obtain a token before the connection attempt fails
    pub token_timeout_ms: u64,
    /// Try to reconnect when the socket closes without an explicit close
    pub reconnect_on_abnormal_close: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_timeout_ms: 20000,
            reconnect_on_abnormal_close: true,
        }
    }
}

/// Authorization context resolution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// After all contexts fail, retry once without any hint if the first
    /// attempt carried one
    pub retry_without_hint: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            retry_without_hint: true,
        }
    }
}

/// Entity type to local model name overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub entity_type_to_model: HashMap<String, String>,
}

impl ClientConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load configuration from a JSON string
    pub fn from_json(json_str: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Load `<config dir>/graphsync/client.toml`, falling back to defaults
    /// when it does not exist
    pub fn load_standard() -> Result<Self, ConfigError> {
        if let Some(dir) = dirs::config_dir() {
            let path = dir.join("graphsync").join("client.toml");
            if path.exists() {
                tracing::debug!("Loading client config from {:?}", path);
                return Self::load(&path);
            }
        }
        Ok(Self::default())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.api_origin.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "endpoint.api_origin must not be empty".to_string(),
            ));
        }

        if self.protocol.default_version == 0 {
            return Err(ConfigError::InvalidValue(
                "protocol.default_version must be positive".to_string(),
            ));
        }

        if self.auth.token_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "auth.token_timeout_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Full URL of the GraphSync socket
    pub fn websocket_url(&self) -> Result<Url, ConfigError> {
        let scheme = if self.endpoint.secure { "wss" } else { "ws" };
        let raw = format!("{}://{}", scheme, self.endpoint.api_origin);
        let base = Url::parse(&raw).map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
        base.join(&self.endpoint.path)
            .map_err(|e| ConfigError::InvalidValue(e.to_string()))
    }

    pub fn unsubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.graph.unsubscribe_delay_ms)
    }

    pub fn token_timeout(&self) -> Duration {
        Duration::from_millis(self.auth.token_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.protocol.default_version, 3);
        assert_eq!(config.graph.unsubscribe_delay_ms, 5000);
        assert_eq!(config.graph.default_create_scope, Scope::Auto);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_websocket_url() {
        let mut config = ClientConfig::default();
        config.endpoint.api_origin = "zone.example.com:9443".to_string();
        assert_eq!(
            config.websocket_url().unwrap().as_str(),
            "wss://zone.example.com:9443/graph_sync/gui"
        );

        config.endpoint.secure = false;
        assert!(config.websocket_url().unwrap().as_str().starts_with("ws://"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ClientConfig::from_toml(
            r#"
            [graph]
            unsubscribe_delay_ms = 250

            [models.entity_type_to_model]
            atm_inventory = "atm-inventory"
            "#,
        )
        .unwrap();
        assert_eq!(config.graph.unsubscribe_delay_ms, 250);
        assert_eq!(config.graph.default_create_scope, Scope::Auto);
        assert_eq!(config.protocol.default_version, 3);
        assert_eq!(
            config.models.entity_type_to_model.get("atm_inventory").map(String::as_str),
            Some("atm-inventory")
        );
    }

    #[test]
    fn test_validation() {
        let mut config = ClientConfig::default();
        config.protocol.default_version = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));

        let mut config = ClientConfig::default();
        config.endpoint.api_origin = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = ClientConfig::default();
        let toml_str = config.to_toml().unwrap();
        let parsed = ClientConfig::from_toml(&toml_str).unwrap();
        assert_eq!(parsed.endpoint.path, config.endpoint.path);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(&path, "[protocol]\ndefault_version = 4\n").unwrap();
        let config = ClientConfig::load(&path).unwrap();
        assert_eq!(config.protocol.default_version, 4);

        assert!(matches!(
            ClientConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
