//! Envelope codec: JSON bytes on the wire.

use crate::domain::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::domain::error::{DecodeError, EncodeError};

/// Serializes requests and parses replies. Stateless.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self
    }

    /// Serialize a request envelope.
    pub fn encode(&self, request: &RequestEnvelope) -> Result<Vec<u8>, EncodeError> {
        Ok(serde_json::to_vec(request)?)
    }

    /// Parse inbound bytes into a response envelope.
    ///
    /// Never panics, whatever the input.
    pub fn decode(&self, bytes: &[u8]) -> Result<ResponseEnvelope, DecodeError> {
        let envelope: ResponseEnvelope =
            serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;

        if envelope.id.is_empty() {
            return Err(DecodeError::EmptyId);
        }
        Ok(envelope)
    }
}
