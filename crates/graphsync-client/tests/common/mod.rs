//! Shared setup for integration tests

use std::sync::Arc;

use graphsync_client::testing::{memory_connector, MemoryListener, MockPeer};
use graphsync_client::{ClientConfig, ClientSession, ConnectionMode, MemoryStore, StaticTokenProvider};
use serde_json::{json, Value};

/// Make `tracing` output visible with `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.endpoint.api_origin = "zone.test".to_string();
    config.graph.unsubscribe_delay_ms = 100;
    config
}

/// A session connected as user `u1`, with the server side of its socket
#[allow(dead_code)]
pub async fn connected_session() -> (ClientSession, MockPeer, MemoryListener) {
    connected_session_with(test_config()).await
}

pub async fn connected_session_with(config: ClientConfig) -> (ClientSession, MockPeer, MemoryListener) {
    init_tracing();
    let (connector, mut listener) = memory_connector();
    let session = ClientSession::new(
        &config,
        connector,
        Arc::new(StaticTokenProvider::new("test-token")),
        Arc::new(MemoryStore::new()),
    )
    .expect("valid test config");

    let (connected, peer) = tokio::join!(session.connect(ConnectionMode::Any), async {
        let mut peer = listener.accept().await.expect("socket opened");
        peer.answer_handshake(json!("u1")).await;
        peer
    });
    connected.expect("handshake succeeds");
    (session, peer, listener)
}

/// Graph request payload of a client frame
#[allow(dead_code)]
pub fn graph_payload(request: &Value) -> &Value {
    assert_eq!(request["subtype"], "graph", "not a graph request: {}", request);
    &request["payload"]
}
