//! # Relay Runtime Library
//!
//! Wires configuration, broker, correlator and background tasks into one
//! runtime object. The `relay-runtime` binary is a thin shell around
//! [`RelayRuntime`].
//!
//! ## Startup Sequence
//!
//! 1. Build the broker client for `RELAY_BACKEND`
//! 2. Start the correlator (connect, subscribe, spawn the response listener)
//! 3. Start the loopback responder (in-memory backend only, if enabled)
//! 4. Start the periodic health reporter
//!
//! ## Shutdown Sequence
//!
//! 1. Signal background tasks
//! 2. Stop the correlator (join listener, close channel, release waiters)
//! 3. Join background tasks

#![allow(clippy::module_name_repetitions)]

pub mod broker;
pub mod loopback;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use relay_bus::InMemoryBroker;
use relay_correlator::{Correlator, Outcome, RelayConfig, StopReport};
use serde_json::json;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use broker::{build_broker, BrokerHandle};

/// Runtime knobs that are not part of the correlator's configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Answer requests locally when running on the in-memory broker
    pub loopback: bool,
    /// How often to log a health line
    pub health_interval: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            loopback: true,
            health_interval: Duration::from_secs(30),
        }
    }
}

impl RuntimeOptions {
    /// Read `RELAY_LOOPBACK` and `RELAY_HEALTH_INTERVAL_SECS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            loopback: std::env::var("RELAY_LOOPBACK")
                .ok()
                .and_then(|v| relay_telemetry::parse_flag(&v))
                .unwrap_or(defaults.loopback),
            health_interval: std::env::var("RELAY_HEALTH_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map_or(defaults.health_interval, Duration::from_secs),
        }
    }
}

/// The relay process: correlator plus its background tasks.
pub struct RelayRuntime {
    correlator: Arc<Correlator>,
    memory: Option<Arc<InMemoryBroker>>,
    options: RuntimeOptions,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayRuntime {
    /// Build the runtime. Nothing is connected until [`start`](Self::start).
    pub fn new(config: RelayConfig, options: RuntimeOptions) -> Result<Self> {
        let handle = build_broker(&config)?;
        let correlator =
            Correlator::new(config, handle.broker).context("invalid relay configuration")?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            correlator: Arc::new(correlator),
            memory: handle.memory,
            options,
            shutdown_tx,
            shutdown_rx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the correlator and background tasks.
    pub async fn start(&self) -> Result<()> {
        info!("===========================================");
        info!("  Routing Relay v{}", relay_correlator::VERSION);
        info!("===========================================");

        self.correlator
            .start()
            .await
            .context("failed to start correlator")?;

        let mut tasks = self.tasks.lock().await;

        if let (true, Some(memory)) = (self.options.loopback, &self.memory) {
            let config = self.correlator.config();
            let loopback = loopback::spawn_loopback(
                Arc::clone(memory),
                &config.request_topic,
                &config.response_topic,
                self.shutdown_rx.clone(),
            )?;
            tasks.push(tokio::spawn(async move {
                let _ = loopback.await;
            }));
        }

        tasks.push(self.spawn_health_reporter());

        let config = self.correlator.config();
        info!(
            request_topic = %config.request_topic,
            response_topic = %config.response_topic,
            group = %config.consumer_group,
            "Relay running"
        );
        Ok(())
    }

    /// Send a probe request through the full round trip.
    pub async fn probe(&self) -> Result<Outcome> {
        let outcome = self
            .correlator
            .send(json!({ "type": "probe" }))
            .await
            .context("probe request failed")?;
        info!(outcome = outcome.label(), "Probe finished");
        Ok(outcome)
    }

    /// Stop everything and wait for background tasks.
    pub async fn shutdown(&self) -> Result<StopReport> {
        info!("Initiating graceful shutdown...");

        // Receivers may already be gone
        let _ = self.shutdown_tx.send(true);

        let report = self
            .correlator
            .stop()
            .await
            .context("failed to stop correlator")?;

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task failed");
            }
        }

        info!(released = report.released, "Shutdown complete");
        Ok(report)
    }

    pub fn correlator(&self) -> Arc<Correlator> {
        Arc::clone(&self.correlator)
    }

    fn spawn_health_reporter(&self) -> JoinHandle<()> {
        let correlator = Arc::clone(&self.correlator);
        let interval = self.options.health_interval;
        let mut shutdown = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let health = correlator.health().await;
                        if health.running && !health.consumer_alive {
                            warn!(pending = health.pending, "Response listener is not running");
                        } else {
                            info!(
                                running = health.running,
                                pending = health.pending,
                                consumer_alive = health.consumer_alive,
                                backend = health.backend,
                                "Relay health"
                            );
                        }
                    }
                }
            }
        })
    }
}
