//! Channel adapter: the relay's handle on the broker.
//!
//! Owns the outbound publish path and opens inbound subscriptions on the
//! response topic. Lifecycle is explicit: `open`, then any number of
//! `publish`/`receive`, then `close`. Nothing reopens implicitly.

use crate::domain::config::RelayConfig;
use relay_bus::{BusError, BusResult, InboundStream, MessageBroker};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

pub struct ChannelAdapter {
    broker: Arc<dyn MessageBroker>,
    request_topic: String,
    response_topic: String,
    consumer_group: String,
    consumer_name: String,
    open: AtomicBool,
}

impl ChannelAdapter {
    pub fn new(broker: Arc<dyn MessageBroker>, config: &RelayConfig) -> Self {
        Self {
            broker,
            request_topic: config.request_topic.clone(),
            response_topic: config.response_topic.clone(),
            consumer_group: config.consumer_group.clone(),
            consumer_name: config.consumer_name.clone(),
            open: AtomicBool::new(false),
        }
    }

    /// Connect the broker client.
    pub async fn open(&self) -> BusResult<()> {
        self.broker.connect().await?;
        self.open.store(true, Ordering::SeqCst);
        info!(
            backend = self.broker.name(),
            request_topic = %self.request_topic,
            response_topic = %self.response_topic,
            group = %self.consumer_group,
            "Channel opened"
        );
        Ok(())
    }

    /// Publish bytes and wait for the broker's acknowledgement.
    pub async fn publish(&self, topic: &str, bytes: &[u8]) -> BusResult<()> {
        if !self.is_open() {
            return Err(BusError::NotConnected);
        }
        self.broker.publish(topic, bytes).await.map_err(|e| {
            error!(topic, error = %e, "Publish failed");
            e
        })?;
        debug!(topic, bytes = bytes.len(), "Published");
        Ok(())
    }

    /// Publish to the configured request topic.
    pub async fn publish_request(&self, bytes: &[u8]) -> BusResult<()> {
        self.publish(&self.request_topic, bytes).await
    }

    /// Open a fresh subscription on the response topic.
    pub async fn receive(&self) -> BusResult<Box<dyn InboundStream>> {
        if !self.is_open() {
            return Err(BusError::NotConnected);
        }
        self.broker
            .subscribe(
                &self.response_topic,
                &self.consumer_group,
                &self.consumer_name,
            )
            .await
    }

    /// Close the broker client. Idempotent.
    pub async fn close(&self) -> BusResult<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.broker.close().await?;
        info!(backend = self.broker.name(), "Channel closed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn request_topic(&self) -> &str {
        &self.request_topic
    }

    pub fn response_topic(&self) -> &str {
        &self.response_topic
    }

    pub fn backend(&self) -> &'static str {
        self.broker.name()
    }
}
