//! Broker selection from configuration.

use std::sync::Arc;

use anyhow::Result;
use relay_bus::{InMemoryBroker, MessageBroker};
use relay_correlator::{BrokerBackend, RelayConfig};
use tracing::info;

/// The broker the runtime runs on.
pub struct BrokerHandle {
    /// Shared client used by the correlator
    pub broker: Arc<dyn MessageBroker>,
    /// Concrete handle when running in-process, for the loopback responder
    pub memory: Option<Arc<InMemoryBroker>>,
}

/// Build the broker client named by `config.backend`. Does not connect.
pub fn build_broker(config: &RelayConfig) -> Result<BrokerHandle> {
    match config.backend {
        BrokerBackend::Memory => {
            info!("Using in-memory broker");
            let memory = Arc::new(InMemoryBroker::new());
            Ok(BrokerHandle {
                broker: memory.clone(),
                memory: Some(memory),
            })
        }
        BrokerBackend::Redis => build_redis(config),
    }
}

#[cfg(feature = "redis")]
fn build_redis(config: &RelayConfig) -> Result<BrokerHandle> {
    use anyhow::Context;

    let url = config
        .primary_broker()
        .context("no broker address configured")?;
    let broker = relay_bus::RedisStreamBroker::open(url)
        .with_context(|| format!("invalid Redis broker address '{url}'"))?;
    info!(url, "Using Redis Streams broker");

    Ok(BrokerHandle {
        broker: Arc::new(broker),
        memory: None,
    })
}

#[cfg(not(feature = "redis"))]
fn build_redis(_config: &RelayConfig) -> Result<BrokerHandle> {
    anyhow::bail!("Redis backend requested but relay-runtime was built without the `redis` feature")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_backend() {
        let handle = build_broker(&RelayConfig::default()).unwrap();
        assert_eq!(handle.broker.name(), "memory");
        assert!(handle.memory.is_some());
    }

    #[test]
    fn test_redis_backend_rejects_non_redis_address() {
        let config = RelayConfig {
            backend: BrokerBackend::Redis,
            ..RelayConfig::default()
        };
        // Default address has no redis:// scheme
        assert!(build_broker(&config).is_err());
    }

    #[cfg(feature = "redis")]
    #[test]
    fn test_redis_backend_with_url() {
        let config = RelayConfig {
            backend: BrokerBackend::Redis,
            brokers: vec!["redis://127.0.0.1:6379".to_string()],
            ..RelayConfig::default()
        };
        let handle = build_broker(&config).unwrap();
        assert_eq!(handle.broker.name(), "redis");
        assert!(handle.memory.is_none());
    }
}
