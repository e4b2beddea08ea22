//! WebSocket transport: framing, correlation and connection lifecycle

pub mod channel;
pub mod connection;
pub mod handler;
pub mod message;
pub mod socket;

pub use channel::TransportChannel;
pub use connection::{
    ConnectOptions, ConnectionAttributes, ConnectionInfo, ConnectionState, HandshakeData,
    NOBODY_IDENTITY,
};
pub use handler::{ConnectionErrorHandler, LoggingErrorHandler, PushListener};
pub use message::{
    InboundMessage, PushMessage, PushSubtype, RequestMessage, RequestSubtype, ResponsePayload,
};
pub use socket::{CloseEvent, Connector, OutboundFrame, SocketEvent, SocketHandle, WebSocketConnector};
