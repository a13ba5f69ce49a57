//! Relay configuration with validation.
//!
//! Every field has a local-development default and can be overridden from
//! the environment:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `RELAY_BROKERS` | `localhost:9092` |
//! | `RELAY_REQUEST_TOPIC` | `routing-requests` |
//! | `RELAY_RESPONSE_TOPIC` | `routing-responses` |
//! | `RELAY_CONSUMER_GROUP` | `geo_routing_api_group` |
//! | `RELAY_CONSUMER_NAME` | `relay-<uuid>` |
//! | `RELAY_TIMEOUT_SECS` | `20` |
//! | `RELAY_BACKEND` | `memory` |
//! | `RELAY_RETRY_INITIAL_MS` | `100` |
//! | `RELAY_RETRY_MAX_MS` | `5000` |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Broker implementation to connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    /// In-process broadcast channels
    Memory,
    /// Redis Streams consumer groups
    Redis,
}

impl FromStr for BrokerBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

impl fmt::Display for BrokerBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Redis => f.write_str("redis"),
        }
    }
}

/// Main relay configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Broker addresses
    pub brokers: Vec<String>,
    /// Topic requests are published to
    pub request_topic: String,
    /// Topic replies are consumed from
    pub response_topic: String,
    /// Consumer group shared by relay instances
    pub consumer_group: String,
    /// This instance's name inside the group
    pub consumer_name: String,
    /// Default per-request deadline, in seconds
    pub timeout_secs: f64,
    /// Broker implementation
    pub backend: BrokerBackend,
    /// Inbound re-subscribe backoff
    pub retry: RetryConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            request_topic: "routing-requests".to_string(),
            response_topic: "routing-responses".to_string(),
            consumer_group: "geo_routing_api_group".to_string(),
            consumer_name: format!("relay-{}", Uuid::new_v4()),
            timeout_secs: 20.0,
            backend: BrokerBackend::Memory,
            retry: RetryConfig::default(),
        }
    }
}

/// Backoff bounds for re-subscribing after an inbound failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// First delay, in milliseconds
    pub initial_ms: u64,
    /// Delay cap, in milliseconds
    pub max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_ms: 100,
            max_ms: 5_000,
        }
    }
}

impl RetryConfig {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

impl RelayConfig {
    /// Build from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(brokers) = lookup("RELAY_BROKERS") {
            config.brokers = brokers
                .split(',')
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(topic) = lookup("RELAY_REQUEST_TOPIC") {
            config.request_topic = topic;
        }
        if let Some(topic) = lookup("RELAY_RESPONSE_TOPIC") {
            config.response_topic = topic;
        }
        if let Some(group) = lookup("RELAY_CONSUMER_GROUP") {
            config.consumer_group = group;
        }
        if let Some(name) = lookup("RELAY_CONSUMER_NAME") {
            config.consumer_name = name;
        }
        if let Some(secs) = lookup("RELAY_TIMEOUT_SECS") {
            config.timeout_secs = parse_number("RELAY_TIMEOUT_SECS", &secs)?;
        }
        if let Some(backend) = lookup("RELAY_BACKEND") {
            config.backend = backend.parse()?;
        }
        if let Some(ms) = lookup("RELAY_RETRY_INITIAL_MS") {
            config.retry.initial_ms = parse_number("RELAY_RETRY_INITIAL_MS", &ms)?;
        }
        if let Some(ms) = lookup("RELAY_RETRY_MAX_MS") {
            config.retry.max_ms = parse_number("RELAY_RETRY_MAX_MS", &ms)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.is_empty() {
            return Err(ConfigError::NoBrokers);
        }

        for (name, value) in [
            ("request_topic", &self.request_topic),
            ("response_topic", &self.response_topic),
            ("consumer_group", &self.consumer_group),
            ("consumer_name", &self.consumer_name),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Empty(name));
            }
        }

        if self.request_topic == self.response_topic {
            return Err(ConfigError::SameTopic(self.request_topic.clone()));
        }

        if !self.timeout_secs.is_finite() || self.timeout_secs <= 0.0 {
            return Err(ConfigError::InvalidTimeout(self.timeout_secs));
        }

        if self.retry.initial_ms == 0 || self.retry.max_ms < self.retry.initial_ms {
            return Err(ConfigError::InvalidRetry {
                initial_ms: self.retry.initial_ms,
                max_ms: self.retry.max_ms,
            });
        }

        Ok(())
    }

    /// Default per-request deadline
    pub fn default_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs).unwrap_or(Duration::MAX)
    }

    /// Primary broker address
    pub fn primary_broker(&self) -> Option<&str> {
        self.brokers.first().map(String::as_str)
    }
}

fn parse_number<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Parse {
        key,
        value: raw.to_string(),
    })
}

/// Configuration errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("at least one broker address is required")]
    NoBrokers,

    #[error("{0} cannot be empty")]
    Empty(&'static str),

    #[error("request and response topics must differ (both are '{0}')")]
    SameTopic(String),

    #[error("timeout must be a positive number of seconds, got {0}")]
    InvalidTimeout(f64),

    #[error("invalid retry bounds: initial {initial_ms}ms, max {max_ms}ms")]
    InvalidRetry { initial_ms: u64, max_ms: u64 },

    #[error("unknown broker backend: {0}")]
    UnknownBackend(String),

    #[error("cannot parse {key}={value}")]
    Parse { key: &'static str, value: String },
}
