//! Domain types for the correlator.
//!
//! Correlation ids, envelopes, outcomes, configuration, errors and the
//! correlation table.

pub mod config;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod outcome;
pub mod pending;

// Re-exports for convenience
pub use config::{BrokerBackend, ConfigError, RelayConfig, RetryConfig};
pub use correlation::CorrelationId;
pub use envelope::{RequestEnvelope, ResponseEnvelope};
pub use error::{CorrelatorError, CorrelatorResult, DecodeError, EncodeError, RegisterError};
pub use outcome::{Outcome, Resolution};
pub use pending::{CorrelationStats, CorrelationTable, StatsSnapshot, Waiter};
