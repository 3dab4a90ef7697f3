//! Values exchanged between the engine, event sheets and channels.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A scalar or string value.
///
/// Used for channel contents, event payload fields and p-fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Numeric value.
    Scalar(f64),
    /// String value.
    Text(String),
}

impl Value {
    /// The kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Scalar(_) => ValueKind::Scalar,
            Value::Text(_) => ValueKind::Text,
        }
    }

    /// Get the numeric value, if this is a scalar.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Value::Scalar(v) => Some(*v),
            Value::Text(_) => None,
        }
    }

    /// Get the string value, if this is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Scalar(_) => None,
            Value::Text(s) => Some(s),
        }
    }

    /// The zero value of a kind (0.0 or the empty string).
    pub fn zero(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Scalar => Value::Scalar(0.0),
            ValueKind::Text => Value::Text(String::new()),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Scalar(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Scalar(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "\"{}\"", s),
        }
    }
}

/// Type of a [`Value`], fixed for a channel at its first write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Scalar,
    Text,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Scalar => write!(f, "scalar"),
            ValueKind::Text => write!(f, "string"),
        }
    }
}
