//! JSON envelope serializer.
//!
//! Encoding produces `{"MessageType": "<kind>", "Payload": <payload|null>}`.
//! Decoding is two-step: [`JsonDataSerializer::deserialize_message`] yields the
//! kind plus an unbound payload, and [`JsonDataSerializer::deserialize_payload`]
//! binds it to the shape the caller names for that kind.
//!
//! Non-log payloads pass through the contract pipeline, which normalizes the
//! `StartTime`/`EndTime` timestamps to UTC. `TestMessage` payloads skip it and are bound
//! verbatim, so log text is never rewritten and stays decodable even if a
//! pipeline step misbehaves.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::message::{Message, MessageType, OutgoingMessage};
use crate::error::SerializationError;

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDataSerializer;

impl JsonDataSerializer {
    pub fn new() -> Self {
        Self
    }

    /// Decode the envelope; the payload stays unbound.
    pub fn deserialize_message(&self, raw: &str) -> Result<Message, SerializationError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Bind the payload of `message` to `T`.
    pub fn deserialize_payload<T: DeserializeOwned>(
        &self,
        message: &Message,
    ) -> Result<T, SerializationError> {
        let payload = message.payload.clone().unwrap_or(Value::Null);
        if message.message_type == MessageType::TestMessage {
            return Ok(serde_json::from_value(payload)?);
        }
        Ok(serde_json::from_value(normalize_timestamps(payload))?)
    }

    /// Like [`Self::deserialize_payload`] but rejects a missing payload.
    pub fn require_payload<T: DeserializeOwned>(
        &self,
        message: &Message,
    ) -> Result<T, SerializationError> {
        match &message.payload {
            None | Some(Value::Null) => Err(SerializationError::MissingPayload(message.message_type)),
            Some(_) => self.deserialize_payload(message),
        }
    }

    /// Encode a kind-only signal envelope.
    pub fn serialize_message(&self, kind: MessageType) -> Result<String, SerializationError> {
        let envelope: OutgoingMessage<'_, Value> = OutgoingMessage {
            message_type: kind,
            payload: None,
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Encode an envelope carrying `payload`.
    pub fn serialize_payload<T: Serialize>(
        &self,
        kind: MessageType,
        payload: &T,
    ) -> Result<String, SerializationError> {
        let envelope = OutgoingMessage {
            message_type: kind,
            payload: Some(payload),
        };
        Ok(serde_json::to_string(&envelope)?)
    }
}

/// Object keys whose string values are date/times.
const TIMESTAMP_KEYS: [&str; 2] = ["StartTime", "EndTime"];

/// Rewrite the RFC 3339 values of timestamp keys into their UTC form.
fn normalize_timestamps(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_timestamps).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| match value {
                    Value::String(text) if TIMESTAMP_KEYS.contains(&key.as_str()) => {
                        (key, Value::String(to_utc(text)))
                    }
                    value => (key, normalize_timestamps(value)),
                })
                .collect(),
        ),
        other => other,
    }
}

fn to_utc(text: String) -> String {
    match DateTime::parse_from_rfc3339(&text) {
        Ok(parsed) => parsed
            .with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::AutoSi, true),
        Err(_) => text,
    }
}
