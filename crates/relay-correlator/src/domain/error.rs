//! Error types for the correlator.

use crate::domain::config::ConfigError;
use crate::domain::correlation::CorrelationId;
use relay_bus::BusError;
use thiserror::Error;

/// Request could not be serialized.
#[derive(Debug, Error)]
#[error("failed to encode request: {0}")]
pub struct EncodeError(#[from] pub serde_json::Error);

/// Inbound bytes are not a valid response envelope.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Not JSON, or JSON of the wrong shape
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Well-formed envelope with an empty correlation id
    #[error("response has an empty correlation id")]
    EmptyId,
}

/// Waiter registration was refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegisterError {
    /// The id is already awaiting a reply
    #[error("correlation id already pending: {0}")]
    Duplicate(CorrelationId),

    /// The id is the empty string; no reply could ever match it
    #[error("correlation id cannot be empty")]
    EmptyId,

    /// The table has been shut down
    #[error("correlation table closed")]
    Closed,
}

/// Errors surfaced by the correlator façade.
#[derive(Debug, Error)]
pub enum CorrelatorError {
    /// Another in-flight request already uses this id
    #[error("duplicate correlation id: {0}")]
    DuplicateId(CorrelationId),

    /// Request carried an empty correlation id; nothing was published
    #[error("correlation id cannot be empty")]
    EmptyId,

    /// Transport-level failure; the request's waiter has been removed
    #[error("broker error: {0}")]
    Broker(#[from] BusError),

    /// Request payload could not be serialized
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// `start` has not been called, or `stop` already ran
    #[error("correlator not running")]
    NotRunning,

    /// `start` called twice
    #[error("correlator already running")]
    AlreadyRunning,

    /// The waiter was removed by someone other than this call
    #[error("request {0} was cancelled")]
    Cancelled(CorrelationId),
}

impl From<RegisterError> for CorrelatorError {
    fn from(err: RegisterError) -> Self {
        match err {
            RegisterError::Duplicate(id) => Self::DuplicateId(id),
            RegisterError::EmptyId => Self::EmptyId,
            RegisterError::Closed => Self::NotRunning,
        }
    }
}

/// Result type for correlator operations
pub type CorrelatorResult<T> = Result<T, CorrelatorError>;
