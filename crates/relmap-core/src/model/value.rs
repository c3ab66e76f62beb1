use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A column value as exchanged with the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Real(r) => Some(*r),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }

    /// Short type label used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Text(_) => "text",
            Value::Timestamp(_) => "timestamp",
            Value::Blob(_) => "blob",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Real(r) => write!(f, "{}", r),
            Value::Text(s) => write!(f, "'{}'", s),
            Value::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            Value::Blob(b) => {
                f.write_str("x'")?;
                for byte in b {
                    write!(f, "{:02x}", byte)?;
                }
                f.write_str("'")
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Primary key value
///
/// Keys are restricted to integers and text so that they can be hashed and
/// ordered inside the identity map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Int(i64),
    Text(String),
}

impl Key {
    /// Key carried by a non-null integer or text value
    pub fn from_value(value: &Value) -> Option<Key> {
        match value {
            Value::Integer(i) => Some(Key::Int(*i)),
            Value::Text(s) => Some(Key::Text(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::Int(i) => Value::Integer(*i),
            Key::Text(s) => Value::Text(s.clone()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{}", i),
            Key::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Int(v)
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::Text(v.to_string())
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Key::Text(v)
    }
}

impl From<Key> for Value {
    fn from(k: Key) -> Self {
        k.to_value()
    }
}

/// Declared storage type of a mapped column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Bool,
    Timestamp,
    Blob,
}

impl ColumnType {
    /// Convert a raw store value (or a caller-supplied value) to this type
    ///
    /// Stores without native booleans or timestamps hand back integers and
    /// RFC 3339 text; both are accepted here.
    pub fn coerce(&self, value: Value) -> std::result::Result<Value, String> {
        match (self, value) {
            (_, Value::Null) => Ok(Value::Null),
            (ColumnType::Integer, Value::Integer(i)) => Ok(Value::Integer(i)),
            (ColumnType::Real, Value::Real(r)) => Ok(Value::Real(r)),
            (ColumnType::Real, Value::Integer(i)) => Ok(Value::Real(i as f64)),
            (ColumnType::Text, Value::Text(s)) => Ok(Value::Text(s)),
            (ColumnType::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
            (ColumnType::Bool, Value::Integer(0)) => Ok(Value::Bool(false)),
            (ColumnType::Bool, Value::Integer(1)) => Ok(Value::Bool(true)),
            (ColumnType::Timestamp, Value::Timestamp(t)) => Ok(Value::Timestamp(t)),
            (ColumnType::Timestamp, Value::Text(s)) => DateTime::parse_from_rfc3339(&s)
                .map(|t| Value::Timestamp(t.with_timezone(&Utc)))
                .map_err(|e| format!("invalid timestamp '{}': {}", s, e)),
            (ColumnType::Blob, Value::Blob(b)) => Ok(Value::Blob(b)),
            (ColumnType::Timestamp, Value::Integer(secs)) => DateTime::from_timestamp(secs, 0)
                .map(Value::Timestamp)
                .ok_or_else(|| format!("timestamp {} out of range", secs)),
            (ty, other) => Err(format!(
                "expected {:?}, got {}",
                ty,
                other.type_name()
            )),
        }
    }

    /// Whether values of this type can serve as primary keys
    pub fn is_key_type(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Text)
    }
}
