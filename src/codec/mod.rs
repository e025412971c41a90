//! Named codecs for envelope keys and values.
//!
//! A codec turns decoded domain objects into bytes and back. Codecs are
//! resolved by name through the factory registry; a stream or system with no
//! codec bound passes raw bytes through untouched.

pub mod manager;

use std::sync::Arc;

use serde_json::Value;

use crate::types::{Config, Error, Result};

pub use manager::SerdeManager;

/// A named codec. `encode` and `decode` are inverses on the domain objects
/// the codec supports.
pub trait Serde: Send + Sync {
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}

/// Builds a codec from config. Registered by name in the factory registry.
pub trait SerdeFactory: Send + Sync {
    fn make(&self, config: &Config) -> Result<Arc<dyn Serde>>;
}

// =============================================================================
// Built-in codecs
// =============================================================================

/// JSON codec: any domain value, encoded as UTF-8 JSON.
pub struct JsonSerde;

impl Serde for JsonSerde {
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::serde("json codec", format!("invalid JSON payload: {}", e)))
    }
}

pub struct JsonSerdeFactory;

impl SerdeFactory for JsonSerdeFactory {
    fn make(&self, _config: &Config) -> Result<Arc<dyn Serde>> {
        Ok(Arc::new(JsonSerde))
    }
}

/// String codec: JSON string values, encoded as their raw UTF-8 bytes.
pub struct StringSerde;

impl Serde for StringSerde {
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        match value {
            Value::String(s) => Ok(s.as_bytes().to_vec()),
            other => Err(Error::serde(
                "string codec",
                format!("expected string, got {}", json_type_name(other)),
            )),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        let s = std::str::from_utf8(bytes)
            .map_err(|e| Error::serde("string codec", format!("invalid UTF-8: {}", e)))?;
        Ok(Value::String(s.to_string()))
    }
}

pub struct StringSerdeFactory;

impl SerdeFactory for StringSerdeFactory {
    fn make(&self, _config: &Config) -> Result<Arc<dyn Serde>> {
        Ok(Arc::new(StringSerde))
    }
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
