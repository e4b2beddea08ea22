//! Connection bootstrap: token acquisition, handshake and reconnection

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, TokenError};
use crate::transport::{
    CloseEvent, ConnectOptions, ConnectionErrorHandler, HandshakeData, TransportChannel,
};

/// Token handed out by the login provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub token: String,
    /// Seconds until the token expires
    #[serde(default)]
    pub ttl: Option<u64>,
}

/// One-shot token source
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Fails with `TokenError::Unauthorized` when there is no session
    async fn get_token(&self) -> std::result::Result<AuthToken, TokenError>;
}

/// Provider returning a fixed token
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: Option<String>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    /// Provider that always answers `Unauthorized`
    pub fn unauthorized() -> Self {
        Self { token: None }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self) -> std::result::Result<AuthToken, TokenError> {
        match self.token {
            Some(ref token) => Ok(AuthToken {
                token: token.clone(),
                ttl: None,
            }),
            None => Err(TokenError::Unauthorized),
        }
    }
}

/// Kind of session to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// Use a token if one can be obtained, anonymous otherwise
    #[default]
    Any,
    /// A token is required and the nobody identity is rejected
    Authenticated,
    /// No token is fetched
    Anonymous,
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionMode::Any => "any",
            ConnectionMode::Authenticated => "authenticated",
            ConnectionMode::Anonymous => "anonymous",
        };
        write!(f, "{}", name)
    }
}

/// Obtain a token (if the mode wants one) and connect
///
/// The token request races `token_timeout`; when the timer wins the request
/// is abandoned, not cancelled on the provider side.
pub async fn init_connection(
    channel: &TransportChannel,
    provider: &dyn TokenProvider,
    mode: ConnectionMode,
    token_timeout: Duration,
) -> Result<HandshakeData> {
    let token = match mode {
        ConnectionMode::Anonymous => None,
        ConnectionMode::Any | ConnectionMode::Authenticated => {
            match fetch_token(provider, token_timeout).await {
                Ok(token) => Some(token.token),
                Err(TokenError::Unauthorized) if mode == ConnectionMode::Any => {
                    debug!("No session token, connecting anonymously");
                    None
                }
                Err(e) => return Err(e.into()),
            }
        }
    };

    let options = ConnectOptions {
        token,
        protocol_version: None,
        require_identity: mode == ConnectionMode::Authenticated,
    };
    channel.connect(options).await
}

async fn fetch_token(
    provider: &dyn TokenProvider,
    token_timeout: Duration,
) -> std::result::Result<AuthToken, TokenError> {
    match tokio::time::timeout(token_timeout, provider.get_token()).await {
        Ok(result) => result,
        Err(_) => Err(TokenError::Timeout(token_timeout.as_millis() as u64)),
    }
}

/// Close the connection, ignoring close errors
pub async fn force_close(channel: &TransportChannel) {
    if let Err(e) = channel.close().await {
        debug!("Ignoring close error: {}", e);
    }
}

/// Reconnect as an authenticated session, falling back to an anonymous one
pub async fn authenticate(
    channel: &TransportChannel,
    provider: &dyn TokenProvider,
    token_timeout: Duration,
) -> Result<HandshakeData> {
    force_close(channel).await;
    match init_connection(channel, provider, ConnectionMode::Authenticated, token_timeout).await {
        Ok(data) => Ok(data),
        Err(e) => {
            info!("Authenticated connection failed ({}), falling back to anonymous", e);
            force_close(channel).await;
            init_connection(channel, provider, ConnectionMode::Anonymous, token_timeout).await
        }
    }
}

/// Error handler that reconnects after an abnormal close
pub struct ReconnectingErrorHandler {
    provider: Arc<dyn TokenProvider>,
    token_timeout: Duration,
    reconnect: bool,
}

impl ReconnectingErrorHandler {
    pub fn new(provider: Arc<dyn TokenProvider>, token_timeout: Duration, reconnect: bool) -> Self {
        Self {
            provider,
            token_timeout,
            reconnect,
        }
    }

    /// Force-close, then connect again in `Any` mode
    pub async fn reconnect(&self, channel: &TransportChannel) -> Result<HandshakeData> {
        force_close(channel).await;
        init_connection(channel, self.provider.as_ref(), ConnectionMode::Any, self.token_timeout).await
    }
}

#[async_trait]
impl ConnectionErrorHandler for ReconnectingErrorHandler {
    async fn abnormal_close(
        &self,
        channel: TransportChannel,
        event: CloseEvent,
        opening_completed: bool,
    ) -> Result<()> {
        warn!(
            "WebSocket close not invoked by user, code: {}, socket was {}",
            event.code,
            if opening_completed { "opened" } else { "NOT opened" }
        );
        if !self.reconnect {
            return Ok(());
        }
        match self.reconnect(&channel).await {
            Ok(_) => {
                info!("WebSocket reconnected");
                Ok(())
            }
            Err(e) => {
                warn!("WebSocket reconnection error: {}", e);
                Err(e)
            }
        }
    }

    async fn error_occurred(&self, _channel: TransportChannel, error: String, opening_completed: bool) {
        warn!(
            "WebSocket error, socket was {}: {}",
            if opening_completed { "opened" } else { "NOT opened" },
            error
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::testing::memory_connector;
    use serde_json::json;

    struct SlowProvider;

    #[async_trait]
    impl TokenProvider for SlowProvider {
        async fn get_token(&self) -> std::result::Result<AuthToken, TokenError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(AuthToken {
                token: "late".into(),
                ttl: None,
            })
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl TokenProvider for FailingProvider {
        async fn get_token(&self) -> std::result::Result<AuthToken, TokenError> {
            Err(TokenError::Failed("500".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_timeout() {
        let (connector, _listener) = memory_connector();
        let channel = TransportChannel::new("ws://test", connector, 3);
        let result = init_connection(
            &channel,
            &SlowProvider,
            ConnectionMode::Authenticated,
            Duration::from_millis(20000),
        )
        .await;
        assert!(matches!(
            result,
            Err(SyncError::Token(TokenError::Timeout(20000)))
        ));
    }

    #[tokio::test]
    async fn test_any_mode_degrades_to_anonymous() {
        let (connector, mut listener) = memory_connector();
        let channel = TransportChannel::new("ws://test", connector, 3);
        let provider = StaticTokenProvider::unauthorized();
        let (connected, request) = tokio::join!(
            init_connection(&channel, &provider, ConnectionMode::Any, Duration::from_secs(1)),
            async {
                let mut peer = listener.accept().await.unwrap();
                peer.answer_handshake(json!("nobody")).await
            }
        );
        assert!(connected.unwrap().is_nobody());
        assert!(request["payload"].get("auth").is_none());
    }

    #[tokio::test]
    async fn test_unauthorized_is_fatal_when_authenticated() {
        let (connector, _listener) = memory_connector();
        let channel = TransportChannel::new("ws://test", connector, 3);
        let provider = StaticTokenProvider::unauthorized();
        let result = init_connection(&channel, &provider, ConnectionMode::Authenticated, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(SyncError::Token(TokenError::Unauthorized))));
    }

    #[tokio::test]
    async fn test_other_token_errors_are_fatal_in_any_mode() {
        let (connector, _listener) = memory_connector();
        let channel = TransportChannel::new("ws://test", connector, 3);
        let result = init_connection(&channel, &FailingProvider, ConnectionMode::Any, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(SyncError::Token(TokenError::Failed(_)))));
    }

    #[tokio::test]
    async fn test_authenticate_falls_back_to_anonymous() {
        let (connector, mut listener) = memory_connector();
        let channel = TransportChannel::new("ws://test", connector, 3);
        let provider = StaticTokenProvider::new("expired");

        let server = async {
            // First attempt is granted only the nobody identity
            let mut first = listener.accept().await.unwrap();
            let request = first.answer_handshake(json!("nobody")).await;
            assert_eq!(request["payload"]["auth"]["macaroon"], "expired");

            let mut second = listener.accept().await.unwrap();
            let request = second.answer_handshake(json!("nobody")).await;
            assert!(request["payload"].get("auth").is_none());
            (first, second)
        };
        let (result, _peers) = tokio::join!(
            authenticate(&channel, &provider, Duration::from_secs(1)),
            server
        );
        assert!(result.unwrap().is_nobody());
        assert!(channel.is_open());
    }
}
