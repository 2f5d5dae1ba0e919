use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised by payload validation and serialization.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is empty")]
    Empty,
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Opaque, self-describing message payload.
///
/// Payloads validate themselves and serialize to bytes; the schema is a
/// per-topic convention, not a compile-time contract.
pub trait Payload {
    fn validate(&self) -> Result<(), PayloadError>;
    fn to_bytes(&self) -> Result<Vec<u8>, PayloadError>;
}

/// Dynamic key/value payload, the standard payload shape for device telemetry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MapPayload(pub Map<String, Value>);

impl MapPayload {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Decodes a payload from its JSON byte form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PayloadError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns the string value under `key`, if present.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// The payload as a JSON value, for re-emission to clients.
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

impl Payload for MapPayload {
    fn validate(&self) -> Result<(), PayloadError> {
        if self.0.is_empty() {
            return Err(PayloadError::Empty);
        }
        Ok(())
    }

    fn to_bytes(&self) -> Result<Vec<u8>, PayloadError> {
        Ok(serde_json::to_vec(&self.0)?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{MapPayload, Payload};

    #[test]
    fn map_payload_round_trips_through_bytes() {
        let mut payload = MapPayload::new();
        payload.insert("temperature", json!(21.5));
        payload.insert("unit", json!("C"));

        let bytes = payload.to_bytes().expect("payload should encode");
        let decoded = MapPayload::from_bytes(&bytes).expect("payload should decode");
        assert_eq!(decoded, payload);
        assert_eq!(decoded.get_str("unit"), Some("C"));
    }

    #[test]
    fn empty_payload_fails_validation() {
        let payload = MapPayload::new();
        assert!(payload.validate().is_err());
    }
}
