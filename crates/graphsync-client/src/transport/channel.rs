//! Transport channel
//!
//! Owns the single socket of a session: handshake, UUID request correlation,
//! push fan-out and close/error detection. Recovery after an unexpected close
//! is delegated to the installed [`ConnectionErrorHandler`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::connection::{ConnectOptions, ConnectionInfo, ConnectionState, HandshakeData};
use super::handler::{ConnectionErrorHandler, LoggingErrorHandler, PushListener};
use super::message::{
    decode_envelope, split_batch, InboundMessage, RequestMessage, RequestSubtype, ResponsePayload,
};
use super::socket::{CloseEvent, Connector, OutboundFrame, SocketEvent};
use crate::error::{Result, SyncError, TransportError};

type IdGenerator = Arc<dyn Fn() -> Uuid + Send + Sync>;
type Responder = oneshot::Sender<Result<ResponsePayload>>;

struct PendingRequest {
    sent_at: Instant,
    responder: Responder,
}

struct ChannelState {
    status: ConnectionState,
    outbound: Option<mpsc::UnboundedSender<OutboundFrame>>,
    pending: HashMap<Uuid, PendingRequest>,
    info: Option<ConnectionInfo>,
    close_waiter: Option<oneshot::Sender<()>>,
    opening_completed: bool,
    // Bumped per opened socket so a late event from an old socket is ignored
    generation: u64,
}

impl ChannelState {
    fn reset(&mut self) {
        self.status = ConnectionState::Idle;
        self.outbound = None;
        self.info = None;
    }
}

struct ChannelInner {
    url: String,
    default_protocol_version: u32,
    connector: Arc<dyn Connector>,
    error_handler: RwLock<Arc<dyn ConnectionErrorHandler>>,
    push_listeners: RwLock<Vec<Arc<dyn PushListener>>>,
    id_generator: RwLock<IdGenerator>,
    state: Mutex<ChannelState>,
}

/// The transport channel of one session
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct TransportChannel {
    inner: Arc<ChannelInner>,
}

impl TransportChannel {
    pub fn new(url: impl Into<String>, connector: Arc<dyn Connector>, default_protocol_version: u32) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                url: url.into(),
                default_protocol_version,
                connector,
                error_handler: RwLock::new(Arc::new(LoggingErrorHandler)),
                push_listeners: RwLock::new(Vec::new()),
                id_generator: RwLock::new(Arc::new(Uuid::new_v4)),
                state: Mutex::new(ChannelState {
                    status: ConnectionState::Idle,
                    outbound: None,
                    pending: HashMap::new(),
                    info: None,
                    close_waiter: None,
                    opening_completed: false,
                    generation: 0,
                }),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn set_error_handler(&self, handler: Arc<dyn ConnectionErrorHandler>) {
        *self
            .inner
            .error_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = handler;
    }

    /// Replace the correlation id source
    pub fn set_id_generator(&self, generator: impl Fn() -> Uuid + Send + Sync + 'static) {
        *self
            .inner
            .id_generator
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(generator);
    }

    pub fn add_push_listener(&self, listener: Arc<dyn PushListener>) {
        self.inner
            .push_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn state(&self) -> ConnectionState {
        self.lock_state().status
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Attributes of the current connection, if the handshake completed
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.lock_state().info.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.lock_state().pending.len()
    }

    /// Open the socket and perform the handshake
    pub async fn connect(&self, options: ConnectOptions) -> Result<HandshakeData> {
        {
            let mut state = self.lock_state();
            if !state.status.can_connect() {
                return Err(TransportError::AlreadyConnected.into());
            }
            state.status = ConnectionState::Connecting;
            state.opening_completed = false;
        }

        debug!("Opening WebSocket: {}", self.inner.url);
        let handle = match self.inner.connector.open(&self.inner.url).await {
            Ok(handle) => handle,
            Err(e) => {
                self.lock_state().status = ConnectionState::Errored;
                self.error_handler()
                    .error_occurred(self.clone(), e.to_string(), false)
                    .await;
                self.lock_state().reset();
                return Err(e.into());
            }
        };

        let generation = {
            let mut state = self.lock_state();
            state.generation += 1;
            state.outbound = Some(handle.outbound);
            state.status = ConnectionState::Open;
            state.opening_completed = true;
            state.generation
        };
        tokio::spawn(self.clone().run_reader(handle.inbound, generation));

        self.handshake(&options).await
    }

    async fn handshake(&self, options: &ConnectOptions) -> Result<HandshakeData> {
        let version = options
            .protocol_version
            .unwrap_or(self.inner.default_protocol_version);
        let mut payload = json!({
            "supportedVersions": [version],
            "sessionId": null,
        });
        if let Some(ref token) = options.token {
            payload["auth"] = json!({ "macaroon": token });
        }

        let response = self.send(RequestSubtype::Handshake, payload).await?;
        let data = match response.into_result() {
            Ok(data) => data.unwrap_or_else(|| json!({})),
            Err(e) => {
                warn!("Handshake rejected: {}", e.id);
                return Err(TransportError::HandshakeRejected(e).into());
            }
        };
        let data: HandshakeData = serde_json::from_value(data)?;

        self.lock_state().info = Some(ConnectionInfo::from_handshake(&data, Utc::now()));
        info!(
            version = ?data.version,
            anonymous = data.is_nobody(),
            "GraphSync handshake completed"
        );

        if options.require_identity && data.is_nobody() {
            return Err(TransportError::NobodyIdentity.into());
        }
        Ok(data)
    }

    /// Send a request and wait for its response
    ///
    /// A failed write rejects immediately; there is no per-request timeout.
    pub async fn send(&self, subtype: RequestSubtype, payload: Value) -> Result<ResponsePayload> {
        let receiver = self.dispatch(subtype, payload)?;
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectionClosed.into()),
        }
    }

    fn dispatch(
        &self,
        subtype: RequestSubtype,
        payload: Value,
    ) -> Result<oneshot::Receiver<Result<ResponsePayload>>> {
        let id = self.next_id();
        let mut state = self.lock_state();
        if state.pending.contains_key(&id) {
            warn!("Generated message id is already pending: {}", id);
            return Err(TransportError::UuidCollision(id).into());
        }

        let message = RequestMessage::new(id, subtype, payload);
        let text = serde_json::to_string(&message)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        let outbound = state
            .outbound
            .as_ref()
            .ok_or_else(|| TransportError::SendFailed("connection is not open".to_string()))?;
        debug!("Will send: {}", text);
        if outbound.send(OutboundFrame::Text(text)).is_err() {
            warn!("Sending message {} failed: socket writer is gone", id);
            return Err(TransportError::SendFailed("socket writer is gone".to_string()).into());
        }

        let (responder, receiver) = oneshot::channel();
        state.pending.insert(
            id,
            PendingRequest {
                sent_at: Instant::now(),
                responder,
            },
        );
        Ok(receiver)
    }

    /// Close the connection gracefully
    ///
    /// Resolves once the close is observed, or at once if no socket is open.
    pub async fn close(&self) -> Result<()> {
        let waiter = {
            let mut state = self.lock_state();
            let Some(outbound) = state.outbound.clone() else {
                state.reset();
                return Ok(());
            };
            let (tx, rx) = oneshot::channel();
            state.close_waiter = Some(tx);
            state.status = ConnectionState::Closing;
            if outbound.send(OutboundFrame::Close).is_err() {
                // Writer is gone; nothing will confirm the close
                state.close_waiter = None;
                let pending = std::mem::take(&mut state.pending);
                state.reset();
                drop(state);
                reject_all(pending);
                return Ok(());
            }
            rx
        };
        let _ = waiter.await;
        Ok(())
    }

    fn next_id(&self) -> Uuid {
        let generator = self
            .inner
            .id_generator
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        generator()
    }

    fn error_handler(&self) -> Arc<dyn ConnectionErrorHandler> {
        self.inner
            .error_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, ChannelState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_reader(self, mut inbound: mpsc::UnboundedReceiver<SocketEvent>, generation: u64) {
        loop {
            match inbound.recv().await {
                Some(SocketEvent::Message(text)) => self.handle_message(&text),
                Some(SocketEvent::Error(err)) => self.handle_error(err, generation),
                Some(SocketEvent::Closed(event)) => {
                    self.handle_close(event, generation);
                    return;
                }
                None => {
                    self.handle_close(CloseEvent::abnormal("socket dropped"), generation);
                    return;
                }
            }
        }
    }

    /// Dispatch every envelope of one socket message, in order
    fn handle_message(&self, text: &str) {
        let envelopes = match split_batch(text) {
            Ok(envelopes) => envelopes,
            Err(e) => {
                warn!("Dropping inbound frame: {}", e);
                return;
            }
        };

        for envelope in envelopes {
            debug!("Handling message: {}", envelope);
            match decode_envelope(envelope) {
                Ok(InboundMessage::Response { id, payload }) => self.complete(id, payload),
                Ok(InboundMessage::Push(push)) => {
                    let listeners = self
                        .inner
                        .push_listeners
                        .read()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    for listener in listeners {
                        if let Err(e) = listener.on_push(&push) {
                            error!("Handling push {:?} failed: {}", push.subtype, e);
                        }
                    }
                }
                Err(e) => error!("Dropping inbound envelope: {}", e),
            }
        }
    }

    fn complete(&self, id: Uuid, payload: ResponsePayload) {
        let pending = self.lock_state().pending.remove(&id);
        match pending {
            Some(request) => {
                debug!("Response for {} after {:?}", id, request.sent_at.elapsed());
                let _ = request.responder.send(Ok(payload));
            }
            None => warn!("Response for unknown message id: {}", id),
        }
    }

    fn handle_error(&self, err: String, generation: u64) {
        let opening_completed = {
            let mut state = self.lock_state();
            if state.generation != generation {
                return;
            }
            if state.status != ConnectionState::Closing {
                state.status = ConnectionState::Errored;
            }
            state.opening_completed
        };
        let handler = self.error_handler();
        let channel = self.clone();
        tokio::spawn(async move {
            handler.error_occurred(channel, err, opening_completed).await;
        });
    }

    fn handle_close(&self, event: CloseEvent, generation: u64) {
        let (waiter, pending, opening_completed) = {
            let mut state = self.lock_state();
            if state.generation != generation {
                return;
            }
            let waiter = state.close_waiter.take();
            let pending = std::mem::take(&mut state.pending);
            state.reset();
            (waiter, pending, state.opening_completed)
        };

        if !pending.is_empty() {
            debug!("Abandoning {} pending requests", pending.len());
        }
        reject_all(pending);

        match waiter {
            Some(waiter) => {
                info!("WebSocket closed");
                let _ = waiter.send(());
            }
            None => {
                let handler = self.error_handler();
                let channel = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = handler.abnormal_close(channel, event, opening_completed).await {
                        warn!("Abnormal close handler failed: {}", e);
                    }
                });
            }
        }
    }
}

fn reject_all(pending: HashMap<Uuid, PendingRequest>) {
    for (_, request) in pending {
        let _ = request
            .responder
            .send(Err(SyncError::Transport(TransportError::ConnectionClosed)));
    }
}

impl std::fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportChannel")
            .field("url", &self.inner.url)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        error_payload, memory_connector, push_envelope, response_envelope, MemoryListener, MockPeer,
    };
    use crate::transport::message::PushMessage;
    use async_trait::async_trait;

    async fn open_channel() -> (TransportChannel, MemoryListener, MockPeer) {
        let (connector, mut listener) = memory_connector();
        let channel = TransportChannel::new("ws://test/graph_sync/gui", connector, 3);
        let (connected, peer) = tokio::join!(channel.connect(ConnectOptions::with_token("tok")), async {
            let mut peer = listener.accept().await.unwrap();
            peer.answer_handshake(json!({ "user": "u1" })).await;
            peer
        });
        connected.unwrap();
        (channel, listener, peer)
    }

    #[derive(Default)]
    struct RecordingListener {
        seen: Mutex<Vec<PushMessage>>,
    }

    impl PushListener for RecordingListener {
        fn on_push(&self, push: &PushMessage) -> Result<()> {
            self.seen.lock().unwrap().push(push.clone());
            Ok(())
        }
    }

    struct ClosingHandler {
        closes: mpsc::UnboundedSender<(CloseEvent, bool)>,
    }

    #[async_trait]
    impl ConnectionErrorHandler for ClosingHandler {
        async fn abnormal_close(
            &self,
            _channel: TransportChannel,
            event: CloseEvent,
            opening_completed: bool,
        ) -> Result<()> {
            self.closes.send((event, opening_completed)).unwrap();
            Ok(())
        }

        async fn error_occurred(&self, _channel: TransportChannel, _error: String, _opening_completed: bool) {}
    }

    #[tokio::test]
    async fn test_handshake_payload_and_info() {
        let (connector, mut listener) = memory_connector();
        let channel = TransportChannel::new("ws://test", connector, 4);
        let (connected, request) = tokio::join!(channel.connect(ConnectOptions::with_token("secret")), async {
            let mut peer = listener.accept().await.unwrap();
            peer.answer_handshake(json!({ "user": "u1" })).await
        });

        let data = connected.unwrap();
        assert_eq!(data.session_id.as_deref(), Some("test-session"));
        assert_eq!(request["type"], "request");
        assert_eq!(request["payload"]["supportedVersions"], json!([4]));
        assert_eq!(request["payload"]["sessionId"], Value::Null);
        assert_eq!(request["payload"]["auth"]["macaroon"], "secret");

        assert!(channel.is_open());
        let info = channel.connection_info().unwrap();
        assert_eq!(info.service_version(), Some("test"));
        assert!(info.global_time_seconds_offset.abs() <= 1);
    }

    #[tokio::test]
    async fn test_anonymous_handshake_has_no_auth() {
        let (connector, mut listener) = memory_connector();
        let channel = TransportChannel::new("ws://test", connector, 3);
        let (connected, request) = tokio::join!(channel.connect(ConnectOptions::anonymous()), async {
            let mut peer = listener.accept().await.unwrap();
            peer.answer_handshake(json!("nobody")).await
        });
        assert!(connected.unwrap().is_nobody());
        assert!(request["payload"].get("auth").is_none());
    }

    #[tokio::test]
    async fn test_nobody_identity_rejected_when_required() {
        let (connector, mut listener) = memory_connector();
        let channel = TransportChannel::new("ws://test", connector, 3);
        let (connected, _) = tokio::join!(channel.connect(ConnectOptions::authenticated("t")), async {
            let mut peer = listener.accept().await.unwrap();
            peer.answer_handshake(json!("nobody")).await
        });
        assert!(matches!(
            connected,
            Err(SyncError::Transport(TransportError::NobodyIdentity))
        ));
    }

    #[tokio::test]
    async fn test_handshake_rejected() {
        let (connector, mut listener) = memory_connector();
        let channel = TransportChannel::new("ws://test", connector, 3);
        let (connected, _) = tokio::join!(channel.connect(ConnectOptions::anonymous()), async {
            let mut peer = listener.accept().await.unwrap();
            let request = peer.expect_request("handshake").await;
            peer.respond(&request, error_payload("badVersion"));
            peer
        });
        match connected {
            Err(SyncError::Transport(TransportError::HandshakeRejected(e))) => assert_eq!(e.id, "badVersion"),
            other => panic!("expected HandshakeRejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_idle() {
        let (connector, _listener) = memory_connector();
        connector.fail_next("refused");
        let channel = TransportChannel::new("ws://test", connector, 3);
        let result = channel.connect(ConnectOptions::anonymous()).await;
        assert!(matches!(
            result,
            Err(SyncError::Transport(TransportError::ConnectFailed(_)))
        ));
        assert_eq!(channel.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_second_connect_rejected_while_open() {
        let (channel, _listener, _peer) = open_channel().await;
        assert!(matches!(
            channel.connect(ConnectOptions::anonymous()).await,
            Err(SyncError::Transport(TransportError::AlreadyConnected))
        ));
    }

    #[tokio::test]
    async fn test_responses_matched_by_id() {
        let (channel, _listener, mut peer) = open_channel().await;

        let first = tokio::spawn({
            let channel = channel.clone();
            async move { channel.send(RequestSubtype::Rpc, json!({ "n": 1 })).await }
        });
        let second = tokio::spawn({
            let channel = channel.clone();
            async move { channel.send(RequestSubtype::Rpc, json!({ "n": 2 })).await }
        });

        let a = peer.expect_request("rpc").await;
        let b = peer.expect_request("rpc").await;
        // Answer in reverse order
        peer.respond(&b, json!({ "success": true, "data": b["payload"]["n"].clone() }));
        peer.respond(&a, json!({ "success": true, "data": a["payload"]["n"].clone() }));

        assert_eq!(first.await.unwrap().unwrap().data, Some(json!(1)));
        assert_eq!(second.await.unwrap().unwrap().data, Some(json!(2)));
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_uuid_collision_is_hard_error() {
        let (channel, _listener, _peer) = open_channel().await;
        let fixed = Uuid::new_v4();
        channel.set_id_generator(move || fixed);

        let _pending = channel.dispatch(RequestSubtype::Rpc, json!({})).unwrap();
        match channel.send(RequestSubtype::Rpc, json!({})).await {
            Err(SyncError::Transport(TransportError::UuidCollision(id))) => assert_eq!(id, fixed),
            other => panic!("expected collision, got {:?}", other),
        }
        assert_eq!(channel.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_send_without_socket_fails_immediately() {
        let (connector, _listener) = memory_connector();
        let channel = TransportChannel::new("ws://test", connector, 3);
        assert!(matches!(
            channel.send(RequestSubtype::Graph, json!({})).await,
            Err(SyncError::Transport(TransportError::SendFailed(_)))
        ));
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_abandons_pending_requests() {
        let (channel, _listener, mut peer) = open_channel().await;
        let request = tokio::spawn({
            let channel = channel.clone();
            async move { channel.send(RequestSubtype::Graph, json!({})).await }
        });
        peer.expect_request("graph").await;

        channel.close().await.unwrap();
        assert!(matches!(
            request.await.unwrap(),
            Err(SyncError::Transport(TransportError::ConnectionClosed))
        ));
        assert_eq!(channel.state(), ConnectionState::Idle);
        assert!(channel.connection_info().is_none());
    }

    #[tokio::test]
    async fn test_close_without_socket_resolves() {
        let (connector, _listener) = memory_connector();
        let channel = TransportChannel::new("ws://test", connector, 3);
        channel.close().await.unwrap();
        assert_eq!(channel.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_batch_dispatched_in_order() {
        let (channel, _listener, mut peer) = open_channel().await;
        let listener = Arc::new(RecordingListener::default());
        channel.add_push_listener(listener.clone());

        let request = tokio::spawn({
            let channel = channel.clone();
            async move { channel.send(RequestSubtype::Graph, json!({})).await }
        });
        let sent = peer.expect_request("graph").await;
        peer.send_batch(vec![
            push_envelope("graph", json!({ "n": 1 })),
            response_envelope(&sent, json!({ "success": true })),
            push_envelope("nosub", json!({ "n": 2 })),
        ]);

        assert!(request.await.unwrap().unwrap().success);
        // The response completes mid-batch; the rest of the batch follows
        tokio::task::yield_now().await;
        let seen = listener.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].payload["n"], 1);
        assert_eq!(seen[1].payload["n"], 2);
    }

    #[tokio::test]
    async fn test_abnormal_close_reaches_handler() {
        let (channel, _listener, peer) = open_channel().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.set_error_handler(Arc::new(ClosingHandler { closes: tx }));

        peer.close(1011, "server restart");
        let (event, opening_completed) = rx.recv().await.unwrap();
        assert_eq!(event.code, 1011);
        assert!(opening_completed);
        assert_eq!(channel.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_explicit_close_skips_handler() {
        let (channel, _listener, _peer) = open_channel().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.set_error_handler(Arc::new(ClosingHandler { closes: tx }));

        channel.close().await.unwrap();
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
