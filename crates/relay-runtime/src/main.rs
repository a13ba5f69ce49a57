//! # Routing Relay
//!
//! Entry point for the relay process. Publishes routing requests onto a
//! broker topic and hands each caller the reply that carries its
//! correlation id.
//!
//! ## Environment
//!
//! - `RELAY_BACKEND` - `memory` or `redis`
//! - `RELAY_BROKERS` - comma separated broker addresses
//! - `RELAY_REQUEST_TOPIC` / `RELAY_RESPONSE_TOPIC`
//! - `RELAY_CONSUMER_GROUP` / `RELAY_CONSUMER_NAME`
//! - `RELAY_TIMEOUT_SECS` - default wait for a reply
//! - `RELAY_LOOPBACK` - echo requests locally on the in-memory backend
//! - `RELAY_STARTUP_PROBE` - send one probe request after start
//! - `RELAY_LOG_LEVEL`, `RELAY_JSON_LOGS` - logging

use anyhow::{Context, Result};
use relay_correlator::RelayConfig;
use relay_runtime::{RelayRuntime, RuntimeOptions};
use relay_telemetry::{init_telemetry, TelemetryConfig};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry =
        init_telemetry(TelemetryConfig::from_env()).context("failed to initialize telemetry")?;

    let config = RelayConfig::from_env().context("failed to load relay configuration")?;
    let options = RuntimeOptions::from_env();
    let startup_probe = std::env::var("RELAY_STARTUP_PROBE")
        .ok()
        .and_then(|v| relay_telemetry::parse_flag(&v))
        .unwrap_or(false);

    let runtime = RelayRuntime::new(config, options)?;
    runtime.start().await?;

    if startup_probe {
        match runtime.probe().await {
            Ok(outcome) if outcome.is_response() => info!("Startup probe answered"),
            Ok(outcome) => warn!(outcome = outcome.label(), "Startup probe got no reply"),
            Err(e) => error!(error = %e, "Startup probe failed"),
        }
    }

    info!("Relay is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    runtime.shutdown().await?;

    Ok(())
}
