//! Text payload encoding shared by every connector

use super::{BrokerError, MessageCipher};
use serde_json::{Map, Value};

/// Decoded message body: a flat map of field name to JSON value
pub type Payload = Map<String, Value>;

/// Field carrying an encrypted message body
pub const ENCRYPTED_MESSAGE_KEY: &str = "encrypted-message";

/// Parse a text payload into a map, rejecting anything that is not a JSON object
pub fn decode_payload(topic: &str, bytes: &[u8]) -> Result<Payload, BrokerError> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(BrokerError::Decode {
            topic: topic.to_string(),
            reason: format!("expected a JSON object, got {}", json_type_name(&other)),
        }),
        Err(e) => Err(BrokerError::Decode {
            topic: topic.to_string(),
            reason: e.to_string(),
        }),
    }
}

pub fn encode_payload(payload: &Payload) -> Result<String, BrokerError> {
    Ok(serde_json::to_string(payload)?)
}

/// Wrap an encoded payload as `{"encrypted-message": <cipher text>}`
pub fn wrap_encrypted(
    cipher: &dyn MessageCipher,
    payload: &Payload,
) -> Result<String, BrokerError> {
    let mut wrapper = Payload::new();
    wrapper.insert(
        ENCRYPTED_MESSAGE_KEY.to_string(),
        Value::String(cipher.encrypt(&encode_payload(payload)?)?),
    );
    encode_payload(&wrapper)
}

/// Replace an `encrypted-message` wrapper with its decrypted content
///
/// Payloads without the field, or received without a cipher, pass through.
pub fn unwrap_encrypted(
    cipher: Option<&dyn MessageCipher>,
    topic: &str,
    payload: Payload,
) -> Result<Payload, BrokerError> {
    let Some(cipher) = cipher else {
        return Ok(payload);
    };
    match payload.get(ENCRYPTED_MESSAGE_KEY) {
        None => Ok(payload),
        Some(Value::String(cipher_text)) => {
            let plain_text = cipher.decrypt(cipher_text)?;
            decode_payload(topic, plain_text.as_bytes())
        }
        Some(other) => Err(BrokerError::Decrypt(format!(
            "{ENCRYPTED_MESSAGE_KEY} must be a string, got {}",
            json_type_name(other)
        ))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
