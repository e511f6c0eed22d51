//! The closed set of variable values exchanged between sub-models.
//!
//! Anything a sub-model reads or writes through the runtime is one of these
//! four variants; handing any other shape to a scratch namespace is a type
//! error rather than a silent coercion.

use serde::{Deserialize, Serialize};

use crate::error::EnsembleError;

/// A single variable value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    Scalar(f64),
    /// Dense numeric array, e.g. a time history. The last element is the
    /// current point when the variable participates in coupling.
    Array(Vec<f64>),
}

/// Variant kind, used for the type-consistency checks on user code blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Scalar,
    Integer,
    Boolean,
    Array,
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ValueKind::Scalar => "scalar",
            ValueKind::Integer => "integer",
            ValueKind::Boolean => "boolean",
            ValueKind::Array => "array",
        };
        f.write_str(name)
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Scalar(_) => ValueKind::Scalar,
            Value::Integer(_) => ValueKind::Integer,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Array(_) => ValueKind::Array,
        }
    }

    /// Projection onto the coupling axis: the single scalar that feeds
    /// downstream inputs and residual norms. Arrays contribute their most
    /// recent point; an empty array contributes nothing.
    pub fn coupling_scalar(&self) -> Option<f64> {
        match self {
            Value::Scalar(v) => Some(*v),
            Value::Integer(v) => Some(*v as f64),
            Value::Boolean(v) => Some(if *v { 1.0 } else { 0.0 }),
            Value::Array(values) => values.last().copied(),
        }
    }

    /// Strict scalar access, for callers that require a point value.
    pub fn expect_scalar(&self, variable: &str) -> Result<f64, EnsembleError> {
        self.coupling_scalar().ok_or_else(|| EnsembleError::TypeMismatch {
            variable: variable.to_owned(),
            expected: "scalar".to_owned(),
            got: self.kind().to_string(),
        })
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Scalar(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Array(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coupling_scalar_takes_last_array_point() {
        assert_eq!(Some(3.0), Value::Array(vec![1.0, 2.0, 3.0]).coupling_scalar());
        assert_eq!(None, Value::Array(vec![]).coupling_scalar());
        assert_eq!(Some(2.5), Value::Scalar(2.5).coupling_scalar());
        assert_eq!(Some(1.0), Value::Boolean(true).coupling_scalar());
    }

    #[test]
    fn untagged_serde_round_trip() {
        let v: Value = serde_json::from_str("4.25").unwrap();
        assert_eq!(Value::Scalar(4.25), v);
        let v: Value = serde_json::from_str("[1.0, 2.0]").unwrap();
        assert_eq!(Value::Array(vec![1.0, 2.0]), v);
        let v: Value = serde_json::from_str("true").unwrap();
        assert_eq!(Value::Boolean(true), v);
    }
}
