//! Schema type registry: scalar type tags and their value coercions.

use crate::error::{Error, FieldError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Scalar column types a declared schema may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    /// Boolean
    Boolean,
    /// Calendar date, kept as the source's text
    Date,
    /// Double precision float
    Float,
    /// 64-bit integer
    Integer,
    /// Text
    String,
    /// Timestamp, kept as the source's text
    Timestamp,
    /// Time of day, kept as the source's text
    Time,
    /// Text holding an encoded JSON document
    JsonString,
}

impl ScalarType {
    /// All scalar types, in declaration order.
    pub const ALL: [ScalarType; 8] = [
        ScalarType::Boolean,
        ScalarType::Date,
        ScalarType::Float,
        ScalarType::Integer,
        ScalarType::String,
        ScalarType::Timestamp,
        ScalarType::Time,
        ScalarType::JsonString,
    ];

    /// Look up a type tag. `VARCHAR` is accepted as an alias of `STRING`.
    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag.trim().to_ascii_uppercase().as_str() {
            "BOOLEAN" => Ok(ScalarType::Boolean),
            "DATE" => Ok(ScalarType::Date),
            "FLOAT" => Ok(ScalarType::Float),
            "INTEGER" => Ok(ScalarType::Integer),
            "STRING" | "VARCHAR" => Ok(ScalarType::String),
            "TIMESTAMP" => Ok(ScalarType::Timestamp),
            "TIME" => Ok(ScalarType::Time),
            "JSON_STRING" => Ok(ScalarType::JsonString),
            _ => Err(Error::UnknownType(tag.to_string())),
        }
    }

    /// Canonical tag.
    pub fn tag(&self) -> &'static str {
        match self {
            ScalarType::Boolean => "BOOLEAN",
            ScalarType::Date => "DATE",
            ScalarType::Float => "FLOAT",
            ScalarType::Integer => "INTEGER",
            ScalarType::String => "STRING",
            ScalarType::Timestamp => "TIMESTAMP",
            ScalarType::Time => "TIME",
            ScalarType::JsonString => "JSON_STRING",
        }
    }

    /// Coerce a raw value into this type.
    ///
    /// `null` and the empty string always yield [`Value::Null`].
    pub fn coerce(&self, raw: &JsonValue) -> std::result::Result<Value, FieldError> {
        if is_blank(raw) {
            return Ok(Value::Null);
        }
        match self {
            ScalarType::Boolean => to_bool(raw).map(Value::Bool),
            ScalarType::Float => to_float(raw).map(Value::Float),
            ScalarType::Integer => to_integer(raw).map(Value::Integer),
            ScalarType::String
            | ScalarType::Date
            | ScalarType::Timestamp
            | ScalarType::Time
            | ScalarType::JsonString => Ok(Value::String(to_text(raw))),
        }
    }
}

impl FromStr for ScalarType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_tag(s)
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Coerce `raw` according to a type tag.
///
/// Fails with [`Error::UnknownType`] for tags the registry does not know (including `RECORD`,
/// which only the normalizer handles) and with [`Error::Field`] when the value cannot be coerced.
pub fn coerce(type_tag: &str, raw: &JsonValue) -> Result<Value> {
    let scalar = ScalarType::from_tag(type_tag)?;
    Ok(scalar.coerce(raw)?)
}

/// A normalized, schema-conformant value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Missing, empty or failed value
    Null,
    /// Boolean
    Bool(bool),
    /// Integer
    Integer(i64),
    /// Float
    Float(f64),
    /// Text, including unparsed dates, times and timestamps
    String(String),
    /// Repeated field; never contains `Null`
    List(Vec<Value>),
    /// Nested record
    Record(BTreeMap<String, Value>),
}

impl Value {
    /// Whether this is [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Render as text for a bound SQL parameter. `None` binds SQL `NULL`.
    pub fn to_sql_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::String(s) => Some(s.clone()),
            Value::List(_) | Value::Record(_) => Some(self.to_json().to_string()),
        }
    }

    /// Convert to a JSON value.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Integer(i) => JsonValue::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::List(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Record(fields) => JsonValue::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

/// `null` or `""`.
pub(crate) fn is_blank(raw: &JsonValue) -> bool {
    match raw {
        JsonValue::Null => true,
        JsonValue::String(s) => s.is_empty(),
        _ => false,
    }
}

/// JSON kind name used in diagnostics.
pub(crate) fn json_kind(raw: &JsonValue) -> &'static str {
    match raw {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn to_bool(raw: &JsonValue) -> std::result::Result<bool, FieldError> {
    match raw {
        JsonValue::Bool(b) => Ok(*b),
        JsonValue::Number(n) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "1" => Ok(true),
            "false" | "f" | "no" | "n" | "0" => Ok(false),
            _ => Err(FieldError::InvalidValue {
                expected: "BOOLEAN",
                value: s.clone(),
            }),
        },
        other => Err(FieldError::TypeMismatch {
            expected: "BOOLEAN",
            found: json_kind(other),
        }),
    }
}

fn to_float(raw: &JsonValue) -> std::result::Result<f64, FieldError> {
    let parsed = match raw {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        other => {
            return Err(FieldError::TypeMismatch {
                expected: "FLOAT",
                found: json_kind(other),
            });
        }
    };
    parsed
        .filter(|f| f.is_finite())
        .ok_or_else(|| FieldError::InvalidValue {
            expected: "FLOAT",
            value: to_text(raw),
        })
}

fn to_integer(raw: &JsonValue) -> std::result::Result<i64, FieldError> {
    let invalid = || FieldError::InvalidValue {
        expected: "INTEGER",
        value: to_text(raw),
    };
    match raw {
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else {
                // u64 beyond i64::MAX, or a float truncated toward zero
                n.as_f64()
                    .filter(|f| f.is_finite() && f.abs() < i64::MAX as f64)
                    .map(|f| f.trunc() as i64)
                    .ok_or_else(invalid)
            }
        }
        JsonValue::Bool(b) => Ok(i64::from(*b)),
        JsonValue::String(s) => s.trim().parse::<i64>().map_err(|_| invalid()),
        other => Err(FieldError::TypeMismatch {
            expected: "INTEGER",
            found: json_kind(other),
        }),
    }
}

fn to_text(raw: &JsonValue) -> String {
    match raw {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}
