//! Where a node field takes its value from
//!
//! Each configurable field names one [`ValueSource`]. Resolution is a pure
//! lookup against the fields of the inbound flow message (or the process
//! environment); typed conversion happens afterwards per field.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Source of one node field
///
/// In TOML: `host = { source = "literal", value = "broker.local" }`,
/// `topic = { source = "message", value = "target.topic" }`,
/// `password = { source = "env", value = "BROKER_PASSWORD" }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", content = "value", rename_all = "snake_case")]
pub enum ValueSource {
    /// The field's built-in default
    #[default]
    Default,
    /// A fixed value
    Literal(Value),
    /// A dotted path into the flow message fields
    Message(String),
    /// An environment variable
    Env(String),
}

/// Outcome of resolving a [`ValueSource`]
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Value(Value),
    /// Use the field's default
    Default,
    /// The referenced message field or variable is absent; carries its name
    Missing(String),
}

impl ValueSource {
    pub fn literal(value: impl Into<Value>) -> Self {
        ValueSource::Literal(value.into())
    }

    pub fn message(path: impl Into<String>) -> Self {
        ValueSource::Message(path.into())
    }

    pub fn env(name: impl Into<String>) -> Self {
        ValueSource::Env(name.into())
    }

    pub fn depends_on_message(&self) -> bool {
        matches!(self, ValueSource::Message(_))
    }

    pub fn resolve(&self, fields: &Value) -> Resolved {
        match self {
            ValueSource::Default => Resolved::Default,
            ValueSource::Literal(value) => Resolved::Value(value.clone()),
            ValueSource::Message(path) => lookup_path(fields, path)
                .cloned()
                .map(Resolved::Value)
                .unwrap_or_else(|| Resolved::Missing(format!("msg.{path}"))),
            ValueSource::Env(name) => std::env::var(name)
                .map(|value| Resolved::Value(Value::String(value)))
                .unwrap_or_else(|_| Resolved::Missing(format!("env.{name}"))),
        }
    }
}

/// Follow a dotted path through nested objects; `null` counts as absent
pub fn lookup_path<'a>(fields: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(fields, |value, key| value.get(key))
        .filter(|value| !value.is_null())
}

pub fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn as_port(value: &Value) -> Option<u16> {
    as_u64(value).and_then(|n| u16::try_from(n).ok())
}

pub fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_u64().map(|n| n != 0),
        _ => None,
    }
}
