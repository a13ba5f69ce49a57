//! Outbound ports for the correlator.

use crate::domain::correlation::CorrelationId;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Storage collaborator failure. Logged, never surfaced to the caller.
#[derive(Debug, Error)]
#[error("result sink failed: {0}")]
pub struct SinkError(pub String);

/// Receives successful replies for requests that carried an owner.
///
/// Called on a spawned task after the caller already has its response.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn store(
        &self,
        id: &CorrelationId,
        owner: &str,
        payload: &Value,
    ) -> Result<(), SinkError>;
}
