//! Message types shared by nodes, connections and transports

use bytes::Bytes;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Delivery guarantee level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "u8")]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn as_u8(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }

    /// Parse a JSON number or numeric string, `None` when out of range
    pub fn from_value(value: &Value) -> Option<Self> {
        let level = match value {
            Value::Number(n) => n.as_u64()?,
            Value::String(s) => s.trim().parse::<u64>().ok()?,
            _ => return None,
        };
        u8::try_from(level).ok().and_then(|l| Qos::try_from(l).ok())
    }
}

impl TryFrom<u8> for Qos {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(format!("QoS must be 0, 1 or 2, got {other}")),
        }
    }
}

impl Serialize for Qos {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

/// Message body as handed over by a flow or received from the broker
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Bytes),
    Text(String),
    Json(Value),
}

impl Payload {
    /// Take a JSON flow value, keeping strings as text
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::String(text) => Payload::Text(text),
            other => Payload::Json(other),
        }
    }

    /// Decode broker bytes to text when they are valid UTF-8
    pub fn from_wire(bytes: Bytes) -> Self {
        match std::str::from_utf8(&bytes) {
            Ok(text) => Payload::Text(text.to_string()),
            Err(_) => Payload::Bytes(bytes),
        }
    }

    /// Coerce into the bytes sent on the wire
    ///
    /// Bytes pass through untouched, objects, arrays and null are serialized
    /// as JSON text, numbers and booleans are stringified.
    pub fn to_wire(&self) -> Bytes {
        match self {
            Payload::Bytes(bytes) => bytes.clone(),
            Payload::Text(text) => Bytes::from(text.clone()),
            Payload::Json(Value::String(text)) => Bytes::from(text.clone()),
            Payload::Json(value) => Bytes::from(value.to_string()),
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Text(String::new())
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(bytes))
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Payload::Bytes(bytes) => serializer.collect_seq(bytes.iter()),
            Payload::Text(text) => serializer.serialize_str(text),
            Payload::Json(value) => value.serialize(serializer),
        }
    }
}

/// A message to publish, or one delivered to a subscriber
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Message {
    pub topic: String,
    pub payload: Payload,
    pub qos: Qos,
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_qos(mut self, qos: Qos) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Static birth or will message declared in configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StaticMessage {
    pub topic: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub qos: Qos,
    #[serde(default)]
    pub retain: bool,
}

impl From<&StaticMessage> for Message {
    fn from(message: &StaticMessage) -> Self {
        Message::new(message.topic.clone(), message.payload.as_str())
            .with_qos(message.qos)
            .with_retain(message.retain)
    }
}

/// A publish received from the broker, before routing
#[derive(Debug, Clone, PartialEq)]
pub struct InboundPublish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    pub retain: bool,
}

impl InboundPublish {
    /// Build the message handed to a subscriber
    pub fn to_message(&self) -> Message {
        Message {
            topic: self.topic.clone(),
            payload: Payload::from_wire(self.payload.clone()),
            qos: self.qos,
            retain: self.retain,
        }
    }
}

/// A message arriving from the hosting flow: a payload plus arbitrary fields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowMessage {
    pub payload: Payload,
    pub fields: Value,
}

impl FlowMessage {
    /// Split a JSON object into its `payload` and the remaining fields
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(mut map) => {
                let payload = map
                    .remove("payload")
                    .map(Payload::from_json)
                    .unwrap_or_default();
                Self {
                    payload,
                    fields: Value::Object(map),
                }
            }
            other => Self {
                payload: Payload::from_json(other),
                fields: Value::Object(Default::default()),
            },
        }
    }
}
