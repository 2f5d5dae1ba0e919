use std::sync::Arc;

use thiserror::Error;

/// Callback invoked for each inbound frame on the transport's delivery
/// thread. Handlers must be non-blocking; long-running work belongs on a
/// separate task fed from a buffer.
pub type FrameHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Errors raised by pub/sub transports.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("a subscription already exists for filter {filter}")]
    AlreadySubscribed { filter: String },
    #[error("no subscription exists for filter {filter}")]
    NotSubscribed { filter: String },
    #[error("outbound queue is full")]
    QueueFull,
    #[error("transport is closed")]
    Closed,
    #[error("transport i/o failure: {0}")]
    Io(String),
}

/// Topic-filtered publish/subscribe transport contract.
///
/// Implementations own reconnection; subscribers registered through
/// `subscribe` keep receiving frames across reconnects without manual
/// re-subscription.
pub trait PubSubTransport: Send + Sync {
    fn connect(&self) -> Result<(), TransportError>;
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;
    fn subscribe(&self, filter: &str, handler: FrameHandler) -> Result<(), TransportError>;
    fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;
    fn is_connected(&self) -> bool;
    fn close(&self) -> Result<(), TransportError>;
}
