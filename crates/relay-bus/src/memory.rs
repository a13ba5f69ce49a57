//! # In-Memory Broker
//!
//! Single-process broker built on `tokio::sync::broadcast`, one channel per
//! topic. Every subscription on a topic sees every message published after it
//! was opened; messages published to a topic nobody subscribes to are
//! accepted and dropped.

use crate::broker::{BusError, BusResult, InboundStream, MessageBroker};
use crate::DEFAULT_CHANNEL_CAPACITY;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, warn};

/// In-memory implementation of [`MessageBroker`].
pub struct InMemoryBroker {
    /// Broadcast sender per topic, created on first use.
    topics: RwLock<HashMap<String, broadcast::Sender<Vec<u8>>>>,

    /// Whether `connect` has been called (and `close` has not).
    connected: AtomicBool,

    /// When set, every publish fails.
    fail_publishes: AtomicBool,

    /// Number of upcoming `next()` calls (across all subscriptions) that fail.
    receive_faults: Arc<AtomicUsize>,

    /// Number of upcoming `subscribe()` calls that fail.
    subscribe_faults: AtomicUsize,

    /// Total messages accepted.
    messages_published: AtomicU64,

    /// Total subscriptions opened.
    subscriptions_opened: AtomicU64,

    /// Channel capacity per topic.
    capacity: usize,
}

impl InMemoryBroker {
    /// Create a new broker with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new broker with the given per-topic capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(false),
            fail_publishes: AtomicBool::new(false),
            receive_faults: Arc::new(AtomicUsize::new(0)),
            subscribe_faults: AtomicUsize::new(0),
            messages_published: AtomicU64::new(0),
            subscriptions_opened: AtomicU64::new(0),
            capacity,
        }
    }

    /// Create a broker that is already connected.
    #[must_use]
    pub fn connected() -> Self {
        let broker = Self::new();
        broker.connected.store(true, Ordering::SeqCst);
        broker
    }

    /// Make every subsequent publish fail (or succeed again).
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` receive calls fail.
    pub fn fail_next_receives(&self, count: usize) {
        self.receive_faults.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` subscribe calls fail.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.subscribe_faults.store(count, Ordering::SeqCst);
    }

    /// Open a raw subscription without a consumer group.
    ///
    /// Used by collaborators (and tests) that play the responder role.
    pub fn tap(&self, topic: &str) -> BusResult<MemorySubscription> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        let receiver = self.sender_for(topic)?.subscribe();
        self.subscriptions_opened.fetch_add(1, Ordering::Relaxed);
        Ok(MemorySubscription::new(
            topic.to_string(),
            receiver,
            Arc::clone(&self.receive_faults),
        ))
    }

    /// Whether the broker is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Total messages accepted since creation.
    #[must_use]
    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    /// Total subscriptions opened since creation.
    #[must_use]
    pub fn subscriptions_opened(&self) -> u64 {
        self.subscriptions_opened.load(Ordering::Relaxed)
    }

    /// Number of live receivers on a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .ok()
            .and_then(|topics| topics.get(topic).map(broadcast::Sender::receiver_count))
            .unwrap_or(0)
    }

    /// Get the per-topic channel capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn sender_for(&self, topic: &str) -> BusResult<broadcast::Sender<Vec<u8>>> {
        if let Some(sender) = self
            .topics
            .read()
            .map_err(|_| BusError::Connection("topic table poisoned".into()))?
            .get(topic)
        {
            return Ok(sender.clone());
        }

        let mut topics = self
            .topics
            .write()
            .map_err(|_| BusError::Connection("topic table poisoned".into()))?;
        let sender = topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(sender.clone())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> BusResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        debug!("In-memory broker connected");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> BusResult<()> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(BusError::Publish {
                topic: topic.to_string(),
                reason: "injected publish failure".into(),
            });
        }

        let sender = self.sender_for(topic)?;
        self.messages_published.fetch_add(1, Ordering::Relaxed);

        match sender.send(payload.to_vec()) {
            Ok(receivers) => {
                debug!(topic, receivers, bytes = payload.len(), "Message published");
            }
            Err(_) => {
                // Accepted by the broker, nobody listening
                debug!(topic, bytes = payload.len(), "Message dropped (no subscribers)");
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> BusResult<Box<dyn InboundStream>> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        if take_fault(&self.subscribe_faults) {
            return Err(BusError::Subscribe {
                topic: topic.to_string(),
                reason: "injected subscribe failure".into(),
            });
        }

        let subscription = self.tap(topic)?;
        debug!(topic, group, consumer, "Subscription opened");
        Ok(Box::new(subscription))
    }

    async fn close(&self) -> BusResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        // Dropping the senders closes every receiver once it is drained
        if let Ok(mut topics) = self.topics.write() {
            topics.clear();
        }
        debug!("In-memory broker closed");
        Ok(())
    }
}

/// A subscription on one in-memory topic.
pub struct MemorySubscription {
    topic: String,
    receiver: broadcast::Receiver<Vec<u8>>,
    faults: Arc<AtomicUsize>,
}

impl MemorySubscription {
    fn new(topic: String, receiver: broadcast::Receiver<Vec<u8>>, faults: Arc<AtomicUsize>) -> Self {
        Self {
            topic,
            receiver,
            faults,
        }
    }

    /// Topic this subscription reads from.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl InboundStream for MemorySubscription {
    async fn next(&mut self) -> Option<BusResult<Vec<u8>>> {
        if take_fault(&self.faults) {
            return Some(Err(BusError::Receive("injected receive failure".into())));
        }

        loop {
            match self.receiver.recv().await {
                Ok(bytes) => return Some(Ok(bytes)),
                Err(RecvError::Closed) => return None,
                Err(RecvError::Lagged(count)) => {
                    warn!(topic = %self.topic, lagged = count, "Subscriber lagged, messages dropped");
                }
            }
        }
    }

    async fn drain_buffered(&mut self) -> Vec<Vec<u8>> {
        let mut drained = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(bytes) => drained.push(bytes),
                Err(TryRecvError::Lagged(count)) => {
                    warn!(topic = %self.topic, lagged = count, "Subscriber lagged while draining");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        drained
    }
}

/// Consume one pending fault, if any.
fn take_fault(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}
