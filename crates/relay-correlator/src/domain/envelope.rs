//! Request and response envelopes.
//!
//! Wire shape for both directions:
//!
//! ```json
//! {"id": "abc-2", "payload": {"ok": true}}
//! ```
//!
//! Requests may also carry `owner` and `sent_at`. Responses accept the
//! legacy field name `request_id` in place of `id`, and the legacy flat
//! shape where the result fields sit next to the id:
//!
//! ```json
//! {"request_id": "abc-2", "route_found": true, "cost_km": 3.2}
//! ```
//!
//! A flat reply's payload is the object without its id field.

use crate::domain::correlation::CorrelationId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Outbound request, published to the request topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Correlation id; unique among in-flight requests
    pub id: CorrelationId,
    /// Application payload, opaque to the relay
    pub payload: Value,
    /// Caller identity, used to hand results to a sink
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// When the request was built
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

impl RequestEnvelope {
    /// Create an envelope for an already-built JSON payload.
    pub fn new(id: impl Into<CorrelationId>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
            owner: None,
            sent_at: None,
        }
    }

    /// Create an envelope from any serializable payload.
    pub fn from_payload<T: Serialize>(
        id: impl Into<CorrelationId>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(id, serde_json::to_value(payload)?))
    }

    /// Attach the caller's identity
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Stamp the envelope with the current time
    pub fn stamped(mut self) -> Self {
        self.sent_at = Some(Utc::now());
        self
    }
}

/// Inbound reply, consumed from the response topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct ResponseEnvelope {
    /// Correlation id of the request this answers
    pub id: CorrelationId,
    /// Application payload
    pub payload: Value,
}

const ID_FIELD: &str = "id";
const LEGACY_ID_FIELD: &str = "request_id";
const PAYLOAD_FIELD: &str = "payload";

impl TryFrom<Map<String, Value>> for ResponseEnvelope {
    type Error = String;

    fn try_from(mut object: Map<String, Value>) -> Result<Self, Self::Error> {
        let id = match object
            .remove(ID_FIELD)
            .or_else(|| object.remove(LEGACY_ID_FIELD))
        {
            Some(Value::String(id)) => CorrelationId::new(id),
            Some(other) => return Err(format!("correlation id must be a string, got {other}")),
            None => return Err(format!("missing field `{ID_FIELD}`")),
        };

        let payload = match object.remove(PAYLOAD_FIELD) {
            Some(payload) => payload,
            None if object.is_empty() => Value::Null,
            None => Value::Object(object),
        };

        Ok(Self { id, payload })
    }
}

impl ResponseEnvelope {
    pub fn new(id: impl Into<CorrelationId>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_omits_absent_metadata() {
        let envelope = RequestEnvelope::new("abc-1", json!({"start": [0, 0]}));
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json, json!({"id": "abc-1", "payload": {"start": [0, 0]}}));
    }

    #[test]
    fn test_request_with_metadata() {
        let envelope = RequestEnvelope::new("abc-1", json!(null))
            .with_owner("user-42")
            .stamped();
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["owner"], "user-42");
        assert!(json["sent_at"].is_string());
    }

    #[test]
    fn test_request_from_struct_payload() {
        #[derive(Serialize)]
        struct Route {
            points: Vec<(f64, f64)>,
        }

        let envelope = RequestEnvelope::from_payload(
            "r1",
            &Route {
                points: vec![(1.0, 2.0)],
            },
        )
        .unwrap();
        assert_eq!(envelope.payload, json!({"points": [[1.0, 2.0]]}));
    }

    #[test]
    fn test_response_accepts_request_id_alias() {
        let parsed: ResponseEnvelope =
            serde_json::from_str(r#"{"request_id": "abc-2", "payload": {"ok": true}}"#).unwrap();
        assert_eq!(parsed.id.as_str(), "abc-2");
        assert_eq!(parsed.payload, json!({"ok": true}));
    }

    #[test]
    fn test_flat_response_keeps_result_fields() {
        let parsed: ResponseEnvelope = serde_json::from_str(
            r#"{"request_id": "abc-2", "route_found": true, "route": [[0, 0], [1, 1]], "cost_km": 3.2}"#,
        )
        .unwrap();
        assert_eq!(parsed.id.as_str(), "abc-2");
        assert_eq!(
            parsed.payload,
            json!({"route_found": true, "route": [[0, 0], [1, 1]], "cost_km": 3.2})
        );
    }

    #[test]
    fn test_response_without_payload_or_fields_is_null() {
        let parsed: ResponseEnvelope = serde_json::from_str(r#"{"id": "abc-2"}"#).unwrap();
        assert!(parsed.payload.is_null());
    }

    #[test]
    fn test_response_id_must_be_a_string() {
        assert!(serde_json::from_str::<ResponseEnvelope>(r#"{"id": 42, "payload": 1}"#).is_err());
        assert!(serde_json::from_str::<ResponseEnvelope>(r#"{"payload": 1}"#).is_err());
    }

    #[test]
    fn test_response_round_trips_through_serialize() {
        let envelope = ResponseEnvelope::new("abc-2", json!({"ok": true}));
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let parsed: ResponseEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_response_ignores_unknown_fields() {
        let parsed: ResponseEnvelope = serde_json::from_str(
            r#"{"id": "abc-2", "payload": 1, "type": "route_result", "user_id": "u"}"#,
        )
        .unwrap();
        assert_eq!(parsed.payload, json!(1));
    }
}
