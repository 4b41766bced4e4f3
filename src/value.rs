use std::collections::{BTreeMap, HashMap};

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Type alias for a HashMap representing key-value pairs of attributes (user attributes, device
/// attributes, event parameters).
///
/// # Examples
/// ```
/// # use paywall_trigger::{Attributes, Value};
/// let attributes = [
///     ("age".to_owned(), Value::Int(30)),
///     ("is_premium_member".to_owned(), true.into()),
///     ("username".to_owned(), "john_doe".into()),
/// ].into_iter().collect::<Attributes>();
/// ```
pub type Attributes = HashMap<String, Value>;

/// A value that can be stored in attributes, passed to and returned from the expression evaluator.
///
/// This is a closed set of types so that every type mismatch the evaluator may encounter is
/// enumerable.
#[derive(Debug, Serialize, Deserialize, PartialEq, From, Clone, Default)]
#[serde(untagged)]
pub enum Value {
    /// A null value or absence of value.
    #[default]
    Null,
    /// A boolean value.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A floating point number.
    Float(f64),
    /// A string value.
    String(String),
    /// An ordered list of values.
    List(Vec<Value>),
    /// A string-keyed map of values.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Name of the value type as used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "double",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    #[allow(missing_docs)]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub fn as_str(&self) -> Option<&str> {
        if let Value::String(s) = self {
            Some(s.as_str())
        } else {
            None
        }
    }

    #[allow(missing_docs)]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view of the value. Integers are widened to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<Attributes> for Value {
    fn from(value: Attributes) -> Self {
        Self::Map(value.into_iter().collect())
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                // u64 values above i64::MAX and non-integers end up here.
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(values) => {
                Value::List(values.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::Value;

    #[test]
    fn deserializes_numbers_as_int_or_float() {
        let values: Vec<Value> = serde_json::from_str("[1, 1.5, null, true, \"s\"]").unwrap();
        assert_eq!(
            values,
            vec![
                Value::Int(1),
                Value::Float(1.5),
                Value::Null,
                Value::Bool(true),
                Value::String("s".to_owned()),
            ]
        );
    }

    #[test]
    fn deserializes_nested_values() {
        let value: Value = serde_json::from_str(r#"{"a": [1, {"b": false}]}"#).unwrap();
        let expected = Value::Map(BTreeMap::from([(
            "a".to_owned(),
            Value::List(vec![
                Value::Int(1),
                Value::Map(BTreeMap::from([("b".to_owned(), Value::Bool(false))])),
            ]),
        )]));
        assert_eq!(value, expected);
    }

    #[test]
    fn converts_from_json() {
        let value = Value::from(serde_json::json!({"n": 2, "f": 0.5}));
        let Value::Map(map) = value else {
            panic!("expected map");
        };
        assert_eq!(map["n"], Value::Int(2));
        assert_eq!(map["f"], Value::Float(0.5));
    }

    #[test]
    fn widens_int_to_f64() {
        assert_eq!(Value::Int(3).as_f64(), Some(3.0));
        assert_eq!(Value::String("3".into()).as_f64(), None);
    }
}
