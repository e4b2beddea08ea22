//! Collaborators invoked by the transport channel

use async_trait::async_trait;

use super::channel::TransportChannel;
use super::message::PushMessage;
use super::socket::CloseEvent;
use crate::error::Result;

/// Reacts to connection failures detected by the transport channel
///
/// The channel only detects; recovery (e.g. reconnecting) is the handler's
/// job.
#[async_trait]
pub trait ConnectionErrorHandler: Send + Sync {
    /// Socket closed without an explicit `close()`.
    ///
    /// `opening_completed` is false when the socket closed before it ever
    /// opened.
    async fn abnormal_close(
        &self,
        channel: TransportChannel,
        event: CloseEvent,
        opening_completed: bool,
    ) -> Result<()>;

    /// Socket reported an error; usually followed by a close
    async fn error_occurred(&self, channel: TransportChannel, error: String, opening_completed: bool);
}

/// Handler that only reports failures
#[derive(Debug, Default, Clone)]
pub struct LoggingErrorHandler;

#[async_trait]
impl ConnectionErrorHandler for LoggingErrorHandler {
    async fn abnormal_close(
        &self,
        _channel: TransportChannel,
        event: CloseEvent,
        opening_completed: bool,
    ) -> Result<()> {
        tracing::warn!(
            code = event.code,
            reason = %event.reason,
            "WebSocket close not invoked by user, socket was {}",
            if opening_completed { "opened" } else { "NOT opened" }
        );
        Ok(())
    }

    async fn error_occurred(&self, _channel: TransportChannel, error: String, opening_completed: bool) {
        tracing::warn!(
            "WebSocket error, socket was {}: {}",
            if opening_completed { "opened" } else { "NOT opened" },
            error
        );
    }
}

/// Receives push frames in arrival order
pub trait PushListener: Send + Sync {
    fn on_push(&self, push: &PushMessage) -> Result<()>;
}
