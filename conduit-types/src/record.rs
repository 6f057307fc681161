use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A normalized scalar value, per spec.md §3: "string, integer, float,
/// boolean, null, ISO-formatted temporal string, or JSON-serialized string
/// for compound values". Temporals and compound values cross the adapter
/// boundary already stringified/JSON-encoded; only the sink decides whether
/// to re-parse them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

/// A single row: column name to value, order-preserving because some sinks
/// (the OLAP sink's sanitized-column map) rely on stable column order for
/// the duration of a write.
pub type Record = IndexMap<String, Value>;

/// Bounded sequence of records produced/consumed as a unit (Glossary).
pub type Batch = Vec<Record>;
