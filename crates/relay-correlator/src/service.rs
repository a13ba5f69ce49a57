//! Correlator service - the façade callers talk to.
//!
//! `start()` opens the channel, subscribes to the response topic and spawns
//! the response listener. `send_and_await()` registers a waiter, publishes
//! and suspends until a reply, the deadline or shutdown. `stop()` signals
//! the listener, joins it, closes the channel and releases every waiter
//! still pending.

use crate::domain::config::RelayConfig;
use crate::domain::correlation::CorrelationId;
use crate::domain::envelope::RequestEnvelope;
use crate::domain::error::{CorrelatorError, CorrelatorResult};
use crate::domain::outcome::Outcome;
use crate::domain::pending::{CorrelationTable, StatsSnapshot};
use crate::ipc::channel::ChannelAdapter;
use crate::ipc::codec::EnvelopeCodec;
use crate::ipc::listener::{ListenerReport, ResponseListener};
use crate::ports::outbound::ResultSink;
use parking_lot::RwLock;
use relay_bus::MessageBroker;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// State that exists only between `start` and `stop`
struct ActiveRelay {
    channel: Arc<ChannelAdapter>,
    table: Arc<CorrelationTable>,
}

struct Running {
    active: Arc<ActiveRelay>,
    shutdown_tx: watch::Sender<bool>,
    listener: JoinHandle<ListenerReport>,
}

/// Summary returned by [`Correlator::stop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopReport {
    /// Waiters released with [`Outcome::Shutdown`]
    pub released: usize,
    /// Listener counters; `None` if the listener task panicked
    pub listener: Option<ListenerReport>,
}

/// Readiness snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthStatus {
    pub running: bool,
    pub pending: usize,
    pub consumer_alive: bool,
    pub backend: &'static str,
}

/// Releases the waiter's table entry if the owning call is abandoned.
struct WaiterGuard {
    table: Arc<CorrelationTable>,
    id: CorrelationId,
    token: u64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        // No-op once the entry reached a terminal state
        self.table.cancel(&self.id, self.token);
    }
}

/// Request/reply correlator over a publish/subscribe broker.
pub struct Correlator {
    config: RelayConfig,
    broker: Arc<dyn MessageBroker>,
    codec: EnvelopeCodec,
    sink: Option<Arc<dyn ResultSink>>,
    /// Read on every request
    active: RwLock<Option<Arc<ActiveRelay>>>,
    /// Serializes start/stop
    lifecycle: Mutex<Option<Running>>,
}

impl Correlator {
    /// Create a stopped correlator. Validates `config`.
    pub fn new(config: RelayConfig, broker: Arc<dyn MessageBroker>) -> CorrelatorResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            broker,
            codec: EnvelopeCodec::new(),
            sink: None,
            active: RwLock::new(None),
            lifecycle: Mutex::new(None),
        })
    }

    /// Hand successful replies of owned requests to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Open the channel and launch the response listener.
    ///
    /// The response subscription is open before this returns, so no reply to
    /// a request sent afterwards can be missed.
    pub async fn start(&self) -> CorrelatorResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Err(CorrelatorError::AlreadyRunning);
        }

        let channel = Arc::new(ChannelAdapter::new(Arc::clone(&self.broker), &self.config));
        channel.open().await?;

        let inbound = match channel.receive().await {
            Ok(inbound) => inbound,
            Err(e) => {
                error!(error = %e, "Failed to subscribe to responses");
                if let Err(close_err) = channel.close().await {
                    warn!(error = %close_err, "Failed to close channel after subscribe failure");
                }
                return Err(e.into());
            }
        };

        let table = Arc::new(CorrelationTable::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = ResponseListener::new(
            Arc::clone(&table),
            Arc::clone(&channel),
            self.config.retry.clone(),
        );
        let handle = tokio::spawn(listener.run(inbound, shutdown_rx));

        let active = Arc::new(ActiveRelay { channel, table });
        *self.active.write() = Some(Arc::clone(&active));
        *lifecycle = Some(Running {
            active,
            shutdown_tx,
            listener: handle,
        });

        info!(
            backend = self.broker.name(),
            consumer = %self.config.consumer_name,
            default_timeout_ms = self.config.default_timeout().as_millis() as u64,
            "Correlator started"
        );
        Ok(())
    }

    /// Publish `request` and wait up to `timeout` for its reply.
    ///
    /// Returns `Ok(Outcome::TimedOut)` if the deadline passes and
    /// `Ok(Outcome::Shutdown)` if the correlator stops first. A broker
    /// failure is returned as an error after the waiter is removed.
    pub async fn send_and_await(
        &self,
        request: RequestEnvelope,
        timeout: Duration,
    ) -> CorrelatorResult<Outcome> {
        let active = self
            .active
            .read()
            .clone()
            .ok_or(CorrelatorError::NotRunning)?;

        let bytes = self.codec.encode(&request)?;

        // Register before publishing so an instant reply finds its waiter
        let mut waiter = active.table.register(request.id.clone())?;
        let _guard = WaiterGuard {
            table: Arc::clone(&active.table),
            id: waiter.id().clone(),
            token: waiter.token(),
        };

        if let Err(e) = active.channel.publish_request(&bytes).await {
            active.table.cancel(waiter.id(), waiter.token());
            relay_telemetry::PUBLISH_FAILURES.inc();
            warn!(correlation_id = %request.id, error = %e, "Request not published");
            return Err(e.into());
        }
        relay_telemetry::REQUESTS_PUBLISHED.inc();
        debug!(
            correlation_id = %request.id,
            topic = %active.channel.request_topic(),
            timeout_ms = timeout.as_millis() as u64,
            "Published request"
        );

        let outcome = match tokio::time::timeout(timeout, waiter.slot()).await {
            Ok(Ok(resolution)) => Outcome::from(resolution),
            Ok(Err(_)) => return Err(CorrelatorError::Cancelled(request.id)),
            Err(_) => {
                if active.table.expire(waiter.id(), waiter.token()) {
                    warn!(
                        correlation_id = %request.id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Request timed out"
                    );
                    Outcome::TimedOut
                } else {
                    // Something else claimed the entry at the deadline
                    match waiter.slot().await {
                        Ok(resolution) => Outcome::from(resolution),
                        Err(_) => return Err(CorrelatorError::Cancelled(request.id)),
                    }
                }
            }
        };

        if let Outcome::Response(payload) = &outcome {
            debug!(
                correlation_id = %request.id,
                elapsed_ms = waiter.elapsed().as_millis() as u64,
                "Received response"
            );
            self.hand_to_sink(&request, payload);
        }
        Ok(outcome)
    }

    /// Send `payload` under a generated id with the default timeout.
    pub async fn send(&self, payload: Value) -> CorrelatorResult<Outcome> {
        let request = RequestEnvelope::new(CorrelationId::generate(), payload).stamped();
        self.send_and_await(request, self.config.default_timeout())
            .await
    }

    /// Remove a pending request from outside its `send_and_await` call.
    ///
    /// The blocked call returns [`CorrelatorError::Cancelled`].
    pub fn remove(&self, id: &CorrelationId) -> bool {
        self.active
            .read()
            .as_ref()
            .is_some_and(|active| active.table.remove(id))
    }

    /// Stop the listener, close the channel and release pending waiters.
    pub async fn stop(&self) -> CorrelatorResult<StopReport> {
        let mut lifecycle = self.lifecycle.lock().await;
        let running = lifecycle.take().ok_or(CorrelatorError::NotRunning)?;
        self.active.write().take();

        info!("Stopping correlator");
        // Receiver gone means the listener already exited
        let _ = running.shutdown_tx.send(true);

        let listener = match running.listener.await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "Response listener task failed");
                None
            }
        };

        if let Err(e) = running.active.channel.close().await {
            error!(error = %e, "Failed to close channel");
        }

        let released = running.active.table.shutdown_all();
        info!(released, "Correlator stopped");

        Ok(StopReport { released, listener })
    }

    /// Current readiness.
    pub async fn health(&self) -> HealthStatus {
        let lifecycle = self.lifecycle.lock().await;
        match lifecycle.as_ref() {
            Some(running) => HealthStatus {
                running: true,
                pending: running.active.table.pending_count(),
                consumer_alive: !running.listener.is_finished(),
                backend: self.broker.name(),
            },
            None => HealthStatus {
                running: false,
                pending: 0,
                consumer_alive: false,
                backend: self.broker.name(),
            },
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.read().is_some()
    }

    /// Requests currently awaiting a reply
    pub fn pending_count(&self) -> usize {
        self.active
            .read()
            .as_ref()
            .map_or(0, |active| active.table.pending_count())
    }

    /// Counters for the current run
    pub fn stats(&self) -> Option<StatsSnapshot> {
        self.active
            .read()
            .as_ref()
            .map(|active| active.table.stats().snapshot())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn hand_to_sink(&self, request: &RequestEnvelope, payload: &Value) {
        let (Some(sink), Some(owner)) = (&self.sink, &request.owner) else {
            return;
        };

        let sink = Arc::clone(sink);
        let id = request.id.clone();
        let owner = owner.clone();
        let payload = payload.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.store(&id, &owner, &payload).await {
                warn!(correlation_id = %id, owner = %owner, error = %e, "Failed to store result");
            }
        });
    }
}
