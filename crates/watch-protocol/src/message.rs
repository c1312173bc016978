//! Protocol message types for client communication.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Commands a client may send over its connection.
///
/// Encoded as a JSON object tagged by `type`:
///
/// ```json
/// {"type": "reset_counter"}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Reset the watcher's counter
    ResetCounter,
}

impl ControlMessage {
    /// Decodes a control message from a text frame.
    ///
    /// Malformed JSON and unrecognized commands both come back as a
    /// [`DecodeError`]; callers treat either as a soft error.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;

        let kind = match value.get("type") {
            Some(serde_json::Value::String(kind)) => kind.clone(),
            Some(_) | None => return Err(DecodeError::MissingType),
        };

        serde_json::from_value(value).map_err(|_| DecodeError::Unrecognized(kind))
    }

    /// Encodes the message as a JSON text frame.
    pub fn encode(&self) -> Result<String, EncodeError> {
        serde_json::to_string(self).map_err(|e| EncodeError(e.to_string()))
    }

    /// Creates a reset-counter command.
    pub fn reset_counter() -> Self {
        Self::ResetCounter
    }
}

/// Encodes one outbound event as a JSON text frame.
pub fn encode_event<T: Serialize>(event: &T) -> Result<String, EncodeError> {
    serde_json::to_string(event).map_err(|e| EncodeError(e.to_string()))
}

/// Why an inbound frame could not be turned into a [`ControlMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Malformed JSON: {0}")]
    Malformed(String),

    #[error("Missing or non-string \"type\" field")]
    MissingType,

    #[error("Unrecognized command: {0}")]
    Unrecognized(String),
}

/// An outbound value could not be serialized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Failed to encode message: {0}")]
pub struct EncodeError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    use watch_core::{CounterValue, WatcherId};

    #[test]
    fn test_decode_reset_counter() {
        let msg = ControlMessage::decode(r#"{"type":"reset_counter"}"#).unwrap();
        assert_eq!(msg, ControlMessage::ResetCounter);
    }

    #[test]
    fn test_decode_ignores_extra_fields() {
        let msg = ControlMessage::decode(r#"{"type":"reset_counter","note":"x"}"#).unwrap();
        assert_eq!(msg, ControlMessage::ResetCounter);
    }

    #[test]
    fn test_decode_malformed_json() {
        let err = ControlMessage::decode("{not json").unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_decode_missing_type() {
        assert_eq!(
            ControlMessage::decode("{}").unwrap_err(),
            DecodeError::MissingType
        );
        assert_eq!(
            ControlMessage::decode(r#"{"type": 5}"#).unwrap_err(),
            DecodeError::MissingType
        );
        assert_eq!(
            ControlMessage::decode("[1,2,3]").unwrap_err(),
            DecodeError::MissingType
        );
    }

    #[test]
    fn test_decode_unknown_command() {
        let err = ControlMessage::decode(r#"{"type":"self_destruct"}"#).unwrap_err();
        assert_eq!(err, DecodeError::Unrecognized("self_destruct".to_string()));
        assert!(err.to_string().contains("self_destruct"));
    }

    #[test]
    fn test_encode_reset_counter() {
        let json = ControlMessage::reset_counter().encode().unwrap();
        assert_eq!(json, r#"{"type":"reset_counter"}"#);
    }

    #[test]
    fn test_encode_event_is_plain_json() {
        let cv = CounterValue::new(WatcherId::new("watcher-9"), 1, 1);
        let json = encode_event(&cv).unwrap();
        let parsed: CounterValue = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, cv);
    }
}
