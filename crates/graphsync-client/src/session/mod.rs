//! Session composition: one connection and everything layered on it

pub mod auth;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

pub use auth::{
    authenticate, force_close, init_connection, AuthToken, ConnectionMode, ReconnectingErrorHandler,
    StaticTokenProvider, TokenProvider,
};

use crate::adapter::{AdapterOptions, EntityAdapter};
use crate::config::ClientConfig;
use crate::context::ContextRegistry;
use crate::error::Result;
use crate::graph::{GraphService, RpcService};
use crate::requests::ActiveRequestTracker;
use crate::store::{EntityStore, ModelNames};
use crate::transport::{Connector, HandshakeData, TransportChannel, WebSocketConnector};

/// All per-session components, wired together
///
/// Cheap to clone; clones share the same connection and caches.
#[derive(Clone)]
pub struct ClientSession {
    channel: TransportChannel,
    tracker: ActiveRequestTracker,
    graph: GraphService,
    rpc: RpcService,
    contexts: ContextRegistry,
    adapter: EntityAdapter,
    provider: Arc<dyn TokenProvider>,
    token_timeout: Duration,
}

impl ClientSession {
    /// Build a session; nothing is connected until [`ClientSession::connect`]
    pub fn new(
        config: &ClientConfig,
        connector: Arc<dyn Connector>,
        provider: Arc<dyn TokenProvider>,
        store: Arc<dyn EntityStore>,
    ) -> Result<Self> {
        config.validate()?;
        let url = config.websocket_url()?;

        let channel = TransportChannel::new(url.as_str(), connector, config.protocol.default_version);
        channel.set_error_handler(Arc::new(ReconnectingErrorHandler::new(
            provider.clone(),
            config.token_timeout(),
            config.auth.reconnect_on_abnormal_close,
        )));

        let tracker = ActiveRequestTracker::new();
        let graph = GraphService::new(channel.clone(), tracker.clone(), config.unsubscribe_delay());
        let rpc = RpcService::new(channel.clone(), tracker.clone());
        let contexts = ContextRegistry::new();
        let adapter = EntityAdapter::new(
            graph.clone(),
            contexts.clone(),
            store,
            ModelNames::new(config.models.entity_type_to_model.clone()),
            AdapterOptions {
                default_create_scope: config.graph.default_create_scope,
                retry_without_hint: config.context.retry_without_hint,
            },
        );

        Ok(Self {
            channel,
            tracker,
            graph,
            rpc,
            contexts,
            adapter,
            provider,
            token_timeout: config.token_timeout(),
        })
    }

    /// Session over a real WebSocket
    pub fn websocket(
        config: &ClientConfig,
        provider: Arc<dyn TokenProvider>,
        store: Arc<dyn EntityStore>,
    ) -> Result<Self> {
        Self::new(config, Arc::new(WebSocketConnector::new()), provider, store)
    }

    pub fn channel(&self) -> &TransportChannel {
        &self.channel
    }

    pub fn tracker(&self) -> &ActiveRequestTracker {
        &self.tracker
    }

    pub fn graph(&self) -> &GraphService {
        &self.graph
    }

    pub fn rpc(&self) -> &RpcService {
        &self.rpc
    }

    pub fn contexts(&self) -> &ContextRegistry {
        &self.contexts
    }

    pub fn adapter(&self) -> &EntityAdapter {
        &self.adapter
    }

    /// Open the connection in the given mode
    pub async fn connect(&self, mode: ConnectionMode) -> Result<HandshakeData> {
        info!(mode = %mode, url = self.channel.url(), "Connecting GraphSync session");
        init_connection(&self.channel, self.provider.as_ref(), mode, self.token_timeout).await
    }

    /// Re-establish the connection as an authenticated one, or anonymous
    /// if authentication fails
    pub async fn authenticate(&self) -> Result<HandshakeData> {
        authenticate(&self.channel, self.provider.as_ref(), self.token_timeout).await
    }

    /// Close the connection; never fails
    pub async fn close(&self) {
        force_close(&self.channel).await;
    }
}
