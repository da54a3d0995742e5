//! Structured request payloads with explicit field validation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{BridgeError, BridgeResult};

/// JSON object carried by a request.
///
/// A `null` or absent payload is treated as an empty object; any other
/// non-object document is rejected at the dispatcher boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Map<String, Value>);

impl Payload {
    /// Creates an empty payload.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Converts a raw document into a payload.
    pub fn from_value(value: Value) -> BridgeResult<Self> {
        match value {
            Value::Null => Ok(Self::new()),
            Value::Object(map) => Ok(Self(map)),
            other => Err(BridgeError::invalid_field(
                "payload",
                format!("expected an object, got {}", type_name(&other)),
            )),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// Returns a required non-empty string field.
    pub fn require_str(&self, field: &str) -> BridgeResult<&str> {
        match self.0.get(field) {
            None | Some(Value::Null) => Err(BridgeError::missing_field(field)),
            Some(Value::String(s)) if s.trim().is_empty() => {
                Err(BridgeError::invalid_field(field, "must not be empty"))
            }
            Some(Value::String(s)) => Ok(s.as_str()),
            Some(other) => Err(BridgeError::invalid_field(
                field,
                format!("expected a string, got {}", type_name(other)),
            )),
        }
    }

    /// Returns an optional string field; a present non-string is an error.
    pub fn optional_str(&self, field: &str) -> BridgeResult<Option<&str>> {
        match self.0.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(BridgeError::invalid_field(
                field,
                format!("expected a string, got {}", type_name(other)),
            )),
        }
    }

    /// Returns an optional non-negative integer field.
    pub fn optional_u64(&self, field: &str) -> BridgeResult<Option<u64>> {
        match self.0.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => {
                if let Some(v) = n.as_u64() {
                    Ok(Some(v))
                } else if n.as_i64().is_some_and(|v| v < 0) {
                    Err(BridgeError::invalid_field(field, "must be non-negative"))
                } else {
                    Err(BridgeError::invalid_field(field, "must be an integer"))
                }
            }
            Some(other) => Err(BridgeError::invalid_field(
                field,
                format!("expected an integer, got {}", type_name(other)),
            )),
        }
    }

    pub fn optional_bool(&self, field: &str) -> BridgeResult<Option<bool>> {
        match self.0.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(BridgeError::invalid_field(
                field,
                format!("expected a boolean, got {}", type_name(other)),
            )),
        }
    }

    /// Returns a required field of any JSON type except `null`.
    pub fn require_value(&self, field: &str) -> BridgeResult<&Value> {
        match self.0.get(field) {
            None | Some(Value::Null) => Err(BridgeError::missing_field(field)),
            Some(value) => Ok(value),
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
