//! Shard key values and patterns
//!
//! Key values are totally ordered: `MinKey < Int < Str < MaxKey`. Numbers
//! sort before strings, and the two sentinels bound the whole key space so a
//! partition directory can cover it without gaps.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A single shard key value
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyValue {
    MinKey,
    Int(i64),
    Str(String),
    MaxKey,
}

impl KeyValue {
    /// Convert a JSON value into a key value, if it has a key-able type
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(KeyValue::Int),
            Value::String(s) => Some(KeyValue::Str(s.clone())),
            _ => None,
        }
    }

    pub fn is_min(&self) -> bool {
        matches!(self, KeyValue::MinKey)
    }

    pub fn is_max(&self) -> bool {
        matches!(self, KeyValue::MaxKey)
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::MinKey => write!(f, "MinKey"),
            KeyValue::Int(i) => write!(f, "{}", i),
            KeyValue::Str(s) => write!(f, "\"{}\"", s),
            KeyValue::MaxKey => write!(f, "MaxKey"),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int(v)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::Str(v.to_string())
    }
}

/// The shard key of a partitioned collection: a single top-level field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardKeyPattern {
    pub field: String,
}

impl ShardKeyPattern {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }

    /// Extract the shard key from a document, if present
    pub fn extract(&self, doc: &Value) -> Option<KeyValue> {
        doc.get(&self.field).and_then(KeyValue::from_json)
    }

    pub fn global_min(&self) -> KeyValue {
        KeyValue::MinKey
    }

    pub fn global_max(&self) -> KeyValue {
        KeyValue::MaxKey
    }
}
