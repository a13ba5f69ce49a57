//! Response listener: the single consumer loop.
//!
//! Per inbound message:
//!
//! ```text
//! RECEIVED ─▶ DECODED ─▶ MATCHED ─▶ RESOLVED
//!    │           └─────▶ UNMATCHED ─▶ DISCARDED
//!    └─▶ DECODE_FAILED ─▶ DISCARDED
//! ```
//!
//! Messages are handled one at a time in arrival order. A failing inbound
//! stream is drained of whatever it had already fetched, then replaced by a
//! fresh subscription after a capped exponential backoff. The loop only
//! exits when the shutdown signal fires, after the same drain.

use crate::domain::config::RetryConfig;
use crate::domain::pending::CorrelationTable;
use crate::ipc::backoff::Backoff;
use crate::ipc::channel::ChannelAdapter;
use crate::ipc::codec::EnvelopeCodec;
use relay_bus::InboundStream;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What happened to one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDisposition {
    Resolved,
    Unmatched,
    DecodeFailed,
}

/// Counters for one listener run, returned when it exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerReport {
    pub processed: u64,
    pub resolved: u64,
    pub unmatched: u64,
    pub malformed: u64,
    pub drained: u64,
    pub resubscriptions: u64,
}

impl ListenerReport {
    fn record(&mut self, disposition: MessageDisposition) {
        self.processed += 1;
        match disposition {
            MessageDisposition::Resolved => self.resolved += 1,
            MessageDisposition::Unmatched => self.unmatched += 1,
            MessageDisposition::DecodeFailed => self.malformed += 1,
        }
    }
}

pub struct ResponseListener {
    table: Arc<CorrelationTable>,
    channel: Arc<ChannelAdapter>,
    codec: EnvelopeCodec,
    retry: RetryConfig,
}

impl ResponseListener {
    pub fn new(
        table: Arc<CorrelationTable>,
        channel: Arc<ChannelAdapter>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            table,
            channel,
            codec: EnvelopeCodec::new(),
            retry,
        }
    }

    /// Decode one message and resolve its waiter.
    pub fn handle_message(&self, bytes: &[u8]) -> MessageDisposition {
        let envelope = match self.codec.decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.table.record_decode_failure();
                warn!(error = %e, bytes = bytes.len(), "Discarding malformed response");
                return MessageDisposition::DecodeFailed;
            }
        };

        debug!(correlation_id = %envelope.id, "Decoded response");
        if self.table.resolve(&envelope.id, envelope.payload) {
            MessageDisposition::Resolved
        } else {
            MessageDisposition::Unmatched
        }
    }

    /// Run the listener loop until `shutdown` turns true (or its sender is
    /// dropped).
    pub async fn run(
        self,
        mut inbound: Box<dyn InboundStream>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ListenerReport {
        let mut report = ListenerReport::default();
        let mut backoff = Backoff::new(self.retry.initial(), self.retry.max());

        info!(topic = %self.channel.response_topic(), "Response listener started");

        loop {
            let failure = tokio::select! {
                biased;

                _ = shutdown_signalled(&mut shutdown) => {
                    self.drain(inbound.as_mut(), &mut report).await;
                    break;
                }

                message = inbound.next() => match message {
                    Some(Ok(bytes)) => {
                        backoff.reset();
                        report.record(self.handle_message(&bytes));
                        continue;
                    }
                    Some(Err(e)) => e.to_string(),
                    None => "subscription closed".to_string(),
                },
            };

            warn!(reason = %failure, "Inbound stream failed, re-subscribing");
            self.drain(inbound.as_mut(), &mut report).await;
            match self.resubscribe(&mut backoff, &mut shutdown).await {
                Some(stream) => {
                    inbound = stream;
                    report.resubscriptions += 1;
                }
                None => break,
            }
        }

        info!(
            processed = report.processed,
            resolved = report.resolved,
            unmatched = report.unmatched,
            malformed = report.malformed,
            drained = report.drained,
            resubscriptions = report.resubscriptions,
            "Response listener stopped"
        );
        report
    }

    async fn drain(&self, inbound: &mut dyn InboundStream, report: &mut ListenerReport) {
        let buffered = inbound.drain_buffered().await;
        if buffered.is_empty() {
            return;
        }
        for bytes in &buffered {
            report.record(self.handle_message(bytes));
        }
        report.drained += buffered.len() as u64;
        info!(drained = buffered.len(), "Drained buffered responses");
    }

    /// Keep trying to open a new subscription. `None` if shutdown fired first.
    async fn resubscribe(
        &self,
        backoff: &mut Backoff,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Box<dyn InboundStream>> {
        loop {
            let delay = backoff.next().unwrap_or_else(|| self.retry.max());

            tokio::select! {
                biased;
                _ = shutdown_signalled(shutdown) => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.channel.receive().await {
                Ok(stream) => {
                    info!(topic = %self.channel.response_topic(), "Re-subscribed to responses");
                    return Some(stream);
                }
                Err(e) => {
                    error!(error = %e, retry_in_ms = delay.as_millis() as u64, "Re-subscribe failed");
                }
            }
        }
    }
}

/// Resolves once the flag is true or the sender is gone.
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
