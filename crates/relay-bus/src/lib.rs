//! # Relay Bus - Broker Port for the Request/Reply Relay
//!
//! Abstracts the publish/subscribe transport the relay talks to. The relay
//! only ever needs two primitives: publish raw bytes on a topic, and consume
//! raw bytes from a topic as a member of a consumer group.
//!
//! ```text
//! ┌──────────────┐   publish(topic, bytes)   ┌──────────────┐
//! │   Relay      │ ────────────────────────▶ │              │
//! │              │                           │    Broker    │
//! │              │ ◀──────────────────────── │              │
//! └──────────────┘  subscribe(topic, group)  └──────────────┘
//!                   -> InboundStream
//! ```
//!
//! ## Backends
//!
//! - [`InMemoryBroker`]: `tokio::sync::broadcast` per topic, used for local
//!   development and tests. Supports fault injection.
//! - `RedisStreamBroker` (feature `redis`): Redis Streams with consumer groups.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod broker;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

// Re-export main types
pub use broker::{BusError, BusResult, InboundStream, MessageBroker};
pub use memory::{InMemoryBroker, MemorySubscription};
#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamBroker, RedisStreamSubscription};

/// Messages to buffer per topic before slow subscribers start lagging.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_capacity() {
        assert_eq!(DEFAULT_CHANNEL_CAPACITY, 1000);
    }
}
