//! # Broker Port
//!
//! Traits every broker backend implements, plus the shared error type.

use async_trait::async_trait;
use thiserror::Error;

/// Transport-level failures reported by a broker backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The broker client has not been connected, or was closed.
    #[error("broker not connected")]
    NotConnected,

    /// Could not establish a connection to the broker.
    #[error("broker connection failed: {0}")]
    Connection(String),

    /// The broker rejected or failed to accept a message.
    #[error("publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    /// Could not join the consumer group / open the subscription.
    #[error("subscribe to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },

    /// Reading from an open subscription failed.
    #[error("receive failed: {0}")]
    Receive(String),
}

/// Result alias for broker operations.
pub type BusResult<T> = Result<T, BusError>;

/// Publish/subscribe broker client.
///
/// One client is shared process-wide: `publish` may be called concurrently
/// from any number of tasks. The client has an explicit lifecycle; `connect`
/// must succeed before `publish` or `subscribe`, and nothing reconnects
/// implicitly after `close`.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Short backend name for logs and health reports.
    fn name(&self) -> &'static str;

    /// Open the broker client.
    async fn connect(&self) -> BusResult<()>;

    /// Publish raw bytes to a topic.
    ///
    /// Returns only after the broker has accepted the message, or failed.
    async fn publish(&self, topic: &str, payload: &[u8]) -> BusResult<()>;

    /// Join `group` as `consumer` and start consuming `topic`.
    ///
    /// May be called again after the returned stream fails; each call yields
    /// a fresh subscription.
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> BusResult<Box<dyn InboundStream>>;

    /// Close the broker client. Open subscriptions end after yielding what
    /// they already buffered.
    async fn close(&self) -> BusResult<()>;
}

/// Lazy, unbounded sequence of raw inbound messages for one subscription.
#[async_trait]
pub trait InboundStream: Send {
    /// Wait for the next message.
    ///
    /// - `Some(Ok(bytes))` - the next message in arrival order
    /// - `Some(Err(_))` - the subscription failed; re-subscribe to continue
    /// - `None` - the subscription was closed by the broker
    async fn next(&mut self) -> Option<BusResult<Vec<u8>>>;

    /// Take every message already fetched from the broker but not yet
    /// yielded by [`next`](Self::next), without waiting for new ones.
    ///
    /// Called before a subscription is dropped, on shutdown or after it
    /// failed, so fetched messages are never discarded unseen.
    async fn drain_buffered(&mut self) -> Vec<Vec<u8>>;
}
