//! Pub/sub transports carrying the reading feed.
//!
//! A transport owns one subscription to the feed topic. It is connected,
//! polled with [`FeedTransport::recv`] until the connection is lost, and
//! reconnected by the feed subscriber. New transports are added by
//! implementing the trait; nothing else in the pipeline knows which
//! transport is in use.

mod memory;
mod zmq;

use async_trait::async_trait;
use bytes::Bytes;

pub use memory::{MemoryBroker, MemoryTransport};
pub use zmq::ZmqTransport;

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Transport errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Receive error: {0}")]
    Receive(String),

    #[error("Transport not connected")]
    NotConnected,
}

/// One message taken off the feed
#[derive(Debug, Clone, PartialEq)]
pub struct FeedMessage {
    /// Topic the message was published on, when the transport reports it
    pub topic: Option<String>,
    pub payload: Bytes,
}

impl FeedMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: Some(topic.into()),
            payload: payload.into(),
        }
    }
}

/// Subscription to a pub/sub feed
#[async_trait]
pub trait FeedTransport: Send {
    /// Open the connection and subscribe to the feed topic
    async fn connect(&mut self) -> TransportResult<()>;

    /// Wait for the next message
    ///
    /// `Ok(None)` means the connection was lost. Must be cancel safe: the
    /// subscriber drops a pending call on shutdown.
    async fn recv(&mut self) -> TransportResult<Option<FeedMessage>>;

    /// Tear down the current connection, if any
    async fn disconnect(&mut self);

    /// Endpoint description for logs and errors
    fn describe(&self) -> String;
}
