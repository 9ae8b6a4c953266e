//! Event and cell value types.
//!
//! An [`Event`] is a mapping from feature name to a raw [`Cell`]. Cells are
//! either scalars or small containers (feature specs commonly deliver every
//! value as a length-1 list); containers are unwrapped during aggregation.

use crate::error::{Result, SequencerError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// A single scalar cell value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// No observation. Serialized as `null`.
    #[default]
    Missing,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn is_missing(&self) -> bool {
        match self {
            Value::Missing => true,
            Value::Float(f) => f.is_nan(),
            _ => false,
        }
    }

    /// Numeric view of the value. Only integers and floats are numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) if !f.is_nan() => Some(*f),
            _ => None,
        }
    }

    /// Render the value as text, used for grouping keys.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Missing => None,
            Value::Float(f) if f.is_nan() => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Text(s) => Some(s.clone()),
        }
    }

    /// Short type label used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Missing => "missing",
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
        }
    }

    /// Total order over values: missing < bool < numbers < text.
    ///
    /// Integers and floats compare numerically with each other.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Missing => 0,
                Value::Float(f) if f.is_nan() => 0,
                Value::Bool(_) => 1,
                Value::Int(_) | Value::Float(_) => 2,
                Value::Text(_) => 3,
            }
        }

        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            _ => match (rank(self), rank(other)) {
                (2, 2) => {
                    // Mixed int/float; both are non-NaN here.
                    let a = self.as_f64().unwrap_or_default();
                    let b = other.as_f64().unwrap_or_default();
                    a.total_cmp(&b)
                }
                (ra, rb) => ra.cmp(&rb),
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Missing => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
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

/// A raw event cell: a scalar or a container of scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    List(Vec<Value>),
    Scalar(Value),
}

impl Cell {
    /// Unwrap the cell into a scalar.
    ///
    /// Length-1 lists yield their element and empty lists are missing.
    pub fn into_scalar(self, feature: &str) -> Result<Value> {
        match self {
            Cell::Scalar(v) => Ok(v),
            Cell::List(mut values) => match values.len() {
                0 => Ok(Value::Missing),
                1 => Ok(values.swap_remove(0)),
                len => Err(SequencerError::NonScalarCell {
                    feature: feature.to_string(),
                    len,
                }),
            },
        }
    }

    /// Borrowing variant of [`Cell::into_scalar`].
    pub fn scalar(&self, feature: &str) -> Result<&Value> {
        const MISSING: &Value = &Value::Missing;
        match self {
            Cell::Scalar(v) => Ok(v),
            Cell::List(values) => match values.as_slice() {
                [] => Ok(MISSING),
                [v] => Ok(v),
                _ => Err(SequencerError::NonScalarCell {
                    feature: feature.to_string(),
                    len: values.len(),
                }),
            },
        }
    }
}

impl From<Value> for Cell {
    fn from(v: Value) -> Self {
        Cell::Scalar(v)
    }
}

/// A single observation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event {
    cells: BTreeMap<String, Cell>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion of a scalar cell.
    pub fn with(mut self, feature: impl Into<String>, value: impl Into<Value>) -> Self {
        self.cells.insert(feature.into(), Cell::Scalar(value.into()));
        self
    }

    /// Insert a container cell.
    pub fn with_list(mut self, feature: impl Into<String>, values: Vec<Value>) -> Self {
        self.cells.insert(feature.into(), Cell::List(values));
        self
    }

    pub fn get(&self, feature: &str) -> Option<&Cell> {
        self.cells.get(feature)
    }

    /// Scalar value of a feature, or `None` if the feature is absent.
    pub fn scalar(&self, feature: &str) -> Result<Option<&Value>> {
        self.cells.get(feature).map(|c| c.scalar(feature)).transpose()
    }

    pub fn cells(&self) -> &BTreeMap<String, Cell> {
        &self.cells
    }

    pub fn into_cells(self) -> BTreeMap<String, Cell> {
        self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl FromIterator<(String, Cell)> for Event {
    fn from_iter<I: IntoIterator<Item = (String, Cell)>>(iter: I) -> Self {
        Self {
            cells: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_from_json() {
        let event: Event = serde_json::from_str(
            r#"{"ts": ["2021-01-01T00:00:00Z"], "speed": [1.5], "count": 3, "gear": null, "tags": []}"#,
        )
        .unwrap();

        assert_eq!(
            event.scalar("ts").unwrap(),
            Some(&Value::Text("2021-01-01T00:00:00Z".to_string()))
        );
        assert_eq!(event.scalar("speed").unwrap(), Some(&Value::Float(1.5)));
        assert_eq!(event.scalar("count").unwrap(), Some(&Value::Int(3)));
        assert_eq!(event.scalar("gear").unwrap(), Some(&Value::Missing));
        assert_eq!(event.scalar("tags").unwrap(), Some(&Value::Missing));
        assert_eq!(event.scalar("absent").unwrap(), None);
    }

    #[test]
    fn test_multi_value_cell_is_rejected() {
        let cell = Cell::List(vec![Value::Int(1), Value::Int(2)]);
        let err = cell.into_scalar("pair").unwrap_err();
        assert!(matches!(err, SequencerError::NonScalarCell { len: 2, .. }));
    }

    #[test]
    fn test_total_order() {
        let mut values = vec![
            Value::Text("b".into()),
            Value::Float(2.5),
            Value::Missing,
            Value::Int(2),
            Value::Bool(true),
            Value::Text("a".into()),
        ];
        values.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(
            values,
            vec![
                Value::Missing,
                Value::Bool(true),
                Value::Int(2),
                Value::Float(2.5),
                Value::Text("a".into()),
                Value::Text("b".into()),
            ]
        );
    }

    #[test]
    fn test_missing_serializes_as_null() {
        let json = serde_json::to_string(&vec![Value::Missing, Value::Int(1)]).unwrap();
        assert_eq!(json, "[null,1]");
    }
}
