//! Graph requests, subscriptions and server pushes

pub mod event;
pub mod relations;
pub mod rpc;
pub mod service;

pub use event::{parse_push, GraphEvent, GraphEventListener};
pub use rpc::RpcService;
pub use service::{GraphOperation, GraphRequest, GraphResult, GraphService};
