//! The dynamically typed value of a state variable.

use std::fmt;

use serde::{Deserialize, Serialize};

/// StateValue is the concrete value cached for a fresh state variable.
///
/// Values are dynamically typed: definitions coerce between variants where a
/// numeric or textual reading makes sense, mirroring how authored documents
/// mix literals. `PartialEq` is used for actual-change detection, so a
/// recomputation that reproduces the old value never notifies dependents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    /// No value. The default for a variable that has never been computed.
    Null,
    /// A boolean.
    Bool(bool),
    /// An integer.
    Integer(i64),
    /// A floating-point number.
    Number(f64),
    /// A string.
    Text(String),
    /// An ordered list, the cached form of an array variable.
    List(Vec<StateValue>),
}

impl Default for StateValue {
    fn default() -> Self {
        StateValue::Null
    }
}

impl StateValue {
    /// Returns true for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Null)
    }

    /// Read as a boolean, without coercion.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StateValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Read as an integer. Whole floats convert; everything else is `None`.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            StateValue::Integer(i) => Some(*i),
            StateValue::Number(n) if n.fract() == 0.0 && n.is_finite() => Some(*n as i64),
            _ => None,
        }
    }

    /// Read as a float. Integers widen; everything else is `None`.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            StateValue::Number(n) => Some(*n),
            StateValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Read as text, without coercion.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            StateValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Read as a list, without coercion.
    pub fn as_list(&self) -> Option<&[StateValue]> {
        match self {
            StateValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Lossy numeric reading used by arithmetic definitions.
    ///
    /// `Null` reads as 0, booleans as 0/1, text parses or reads as 0, and a
    /// list reads as its length.
    pub fn coerce_number(&self) -> f64 {
        match self {
            StateValue::Null => 0.0,
            StateValue::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            StateValue::Integer(i) => *i as f64,
            StateValue::Number(n) => *n,
            StateValue::Text(s) => s.trim().parse().unwrap_or(0.0),
            StateValue::List(items) => items.len() as f64,
        }
    }

    /// Lossy textual reading used by text definitions.
    pub fn coerce_text(&self) -> String {
        match self {
            StateValue::Text(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Null => write!(f, ""),
            StateValue::Bool(b) => write!(f, "{}", b),
            StateValue::Integer(i) => write!(f, "{}", i),
            StateValue::Number(n) => write!(f, "{}", n),
            StateValue::Text(s) => write!(f, "{}", s),
            StateValue::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "{}", parts.join(", "))
            }
        }
    }
}

impl From<bool> for StateValue {
    fn from(b: bool) -> Self {
        StateValue::Bool(b)
    }
}

impl From<i64> for StateValue {
    fn from(i: i64) -> Self {
        StateValue::Integer(i)
    }
}

impl From<usize> for StateValue {
    fn from(i: usize) -> Self {
        StateValue::Integer(i as i64)
    }
}

impl From<f64> for StateValue {
    fn from(n: f64) -> Self {
        StateValue::Number(n)
    }
}

impl From<&str> for StateValue {
    fn from(s: &str) -> Self {
        StateValue::Text(s.to_string())
    }
}

impl From<String> for StateValue {
    fn from(s: String) -> Self {
        StateValue::Text(s)
    }
}

impl From<Vec<StateValue>> for StateValue {
    fn from(items: Vec<StateValue>) -> Self {
        StateValue::List(items)
    }
}

impl From<serde_json::Value> for StateValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => StateValue::Null,
            serde_json::Value::Bool(b) => StateValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    StateValue::Integer(i)
                } else {
                    StateValue::Number(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => StateValue::Text(s),
            serde_json::Value::Array(items) => {
                StateValue::List(items.into_iter().map(StateValue::from).collect())
            }
            serde_json::Value::Object(_) => StateValue::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_widens_to_number() {
        assert_eq!(StateValue::Integer(3).as_number(), Some(3.0));
        assert_eq!(StateValue::Number(3.0).as_integer(), Some(3));
        assert_eq!(StateValue::Number(3.5).as_integer(), None);
    }

    #[test]
    fn test_coerce_number() {
        assert_eq!(StateValue::Null.coerce_number(), 0.0);
        assert_eq!(StateValue::Bool(true).coerce_number(), 1.0);
        assert_eq!(StateValue::Text(" 2.5 ".into()).coerce_number(), 2.5);
        assert_eq!(StateValue::Text("abc".into()).coerce_number(), 0.0);
    }

    #[test]
    fn test_json_round_trip() {
        let v = StateValue::List(vec![
            StateValue::Integer(1),
            StateValue::Text("two".into()),
            StateValue::Bool(false),
        ]);
        let json = serde_json::to_value(&v).unwrap();
        let back: StateValue = serde_json::from_value(json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_from_json_value() {
        let v: StateValue = serde_json::json!([1, "a", null]).into();
        assert_eq!(
            v,
            StateValue::List(vec![
                StateValue::Integer(1),
                StateValue::Text("a".into()),
                StateValue::Null,
            ])
        );
    }
}
