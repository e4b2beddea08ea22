//! GraphSync Client - client side of the GraphSync WebSocket protocol
//!
//! This crate provides everything a client needs to talk to a GraphSync
//! backend over one long-lived WebSocket:
//!
//! - **Transport**: framing, request/response correlation, batches, pushes and
//!   the handshake that negotiates version and identity
//! - **Graph**: get/create/update/delete on GRI-addressed resources, debounced
//!   unsubscriptions, relation helpers and RPC calls
//! - **Context**: authorization contexts learned from collections, turned into
//!   auth hints when a direct fetch is forbidden
//! - **Requests**: in-flight request tracking with ordering between dependent
//!   operations (create vs. list fetch)
//! - **Adapter**: store reconciliation of responses and server pushes
//! - **Session**: token acquisition, authenticate/anonymous fallback and
//!   reconnection after abnormal close
//!
//! # Architecture
//!
//! ```text
//! ClientSession
//!   └─ EntityAdapter ── ContextRegistry
//!        └─ GraphService / RpcService ── ActiveRequestTracker
//!             └─ TransportChannel ── Connector (tokio-tungstenite)
//! ```
//!
//! Every component is a cheap clonable handle; all of them belong to one
//! session and are never shared across sessions.

pub mod adapter;
pub mod config;
pub mod context;
pub mod error;
pub mod graph;
pub mod requests;
pub mod session;
pub mod store;
pub mod transport;

#[cfg(any(test, feature = "test_utils"))]
pub mod testing;

pub use adapter::{AdapterOptions, EntityAdapter, FindOptions, RecordEvent};
pub use config::ClientConfig;
pub use context::{ContextEntry, ContextRegistry};
pub use error::{
    BackendError, ConfigError, ProtocolError, Result, StoreError, SyncError, TokenError,
    TransportError,
};
pub use graph::{GraphEvent, GraphOperation, GraphRequest, GraphResult, GraphService, RpcService};
pub use requests::{ActiveRequestTracker, RequestInfo, RequestKind};
pub use session::{AuthToken, ClientSession, ConnectionMode, StaticTokenProvider, TokenProvider};
pub use store::{EntityStore, MemoryStore, Record};
pub use transport::{ConnectOptions, ConnectionInfo, ConnectionState, HandshakeData, TransportChannel};

pub use graphsync_gri::{AuthHint, Gri, GriError, Scope};
