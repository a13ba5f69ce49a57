//! Relay Correlator - request/reply over a publish/subscribe broker.
//!
//! Callers publish a request and block, with a deadline, until the reply
//! carrying the same correlation id shows up on a shared response topic.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          CORRELATOR                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │   caller ── send_and_await(request, timeout)                    │
//! │                │                                                │
//! │   ┌────────────┴───────────┐ resolve ┌───────────────────────┐ │
//! │   │   Correlation Table    │◀────────│   Response Listener   │ │
//! │   │  id -> oneshot slot    │         │ (single consumer loop)│ │
//! │   └────────────┬───────────┘         └───────────▲───────────┘ │
//! │                │ register, then publish         │ decode        │
//! │   ┌────────────┴────────────────────────────────┴────────────┐  │
//! │   │                    Channel Adapter                       │  │
//! │   └────────────┬────────────────────────────────▲────────────┘  │
//! └────────────────┼────────────────────────────────┼───────────────┘
//!                  ▼                                │
//!          request topic ──▶ [ responder ] ──▶ response topic
//! ```
//!
//! # Outcomes
//!
//! - `Outcome::Response(payload)`: the correlated reply
//! - `Outcome::TimedOut`: nothing arrived before the deadline
//! - `Outcome::Shutdown`: `stop()` ran while the request was pending
//! - `Err(CorrelatorError::Broker(_))`: the request never left
//!
//! # Usage
//!
//! ```ignore
//! use relay_correlator::{Correlator, RelayConfig, RequestEnvelope};
//!
//! let correlator = Correlator::new(RelayConfig::from_env()?, broker)?;
//! correlator.start().await?;
//! let outcome = correlator
//!     .send_and_await(RequestEnvelope::new("abc-2", payload), Duration::from_secs(1))
//!     .await?;
//! correlator.stop().await?;
//! ```

#![warn(clippy::all)]
#![deny(unsafe_code)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod domain;
pub mod ipc;
pub mod ports;
pub mod service;

// Re-exports
pub use domain::config::{BrokerBackend, ConfigError, RelayConfig, RetryConfig};
pub use domain::correlation::CorrelationId;
pub use domain::envelope::{RequestEnvelope, ResponseEnvelope};
pub use domain::error::{CorrelatorError, CorrelatorResult, DecodeError, EncodeError, RegisterError};
pub use domain::outcome::Outcome;
pub use domain::pending::{CorrelationStats, CorrelationTable, StatsSnapshot, Waiter};
pub use ipc::{ChannelAdapter, EnvelopeCodec, ListenerReport, MessageDisposition, ResponseListener};
pub use ports::{ResultSink, SinkError};
pub use service::{Correlator, HealthStatus, StopReport};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
