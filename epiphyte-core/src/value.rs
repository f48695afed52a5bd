use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A node in the property graph.
///
/// Values nest arbitrarily: a record field or list element may itself be a
/// record or list. Equality is structural, which is what the codec's
/// round-trip guarantee is stated in terms of.
///
/// The serde representation is untagged, so values map 1:1 onto the natural
/// JSON forms (null, booleans, numbers, strings, arrays, objects). Variant
/// order matters for deserialization: `Int` is tried before `Float`, so a
/// number without a fraction comes back as an integer while `4.0` (which
/// serde_json prints with the fraction) comes back as a float.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Absent/null value.
    Nil,
    /// Boolean value.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Double-precision float. Non-finite values (NaN, infinities) have no
    /// JSON representation and are rejected at the store boundary.
    Float(f64),
    /// UTF-8 text string.
    Str(String),
    /// Ordered heterogeneous sequence.
    List(Vec<Value>),
    /// Record with ordered named fields.
    Record(IndexMap<String, Value>),
}

impl Value {
    /// Creates a record value from field definitions.
    pub fn record(fields: impl IntoIterator<Item = (&'static str, Value)>) -> Self {
        Value::Record(
            fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    /// Creates a list value.
    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::List(items.into_iter().collect())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Returns whether any float in this value, at any depth, is NaN or
    /// infinite. serde_json writes such floats as `null`, so letting one
    /// into a store would corrupt it to `Nil` on reload; the store rejects
    /// them up front.
    pub fn has_non_finite(&self) -> bool {
        match self {
            Value::Float(f) => !f.is_finite(),
            Value::List(items) => items.iter().any(Value::has_non_finite),
            Value::Record(fields) => fields.values().any(Value::has_non_finite),
            _ => false,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the numeric value as a float, widening integers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Record(fields) => Some(fields),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v as f64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(v: IndexMap<String, Value>) -> Self {
        Value::Record(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => Value::Nil,
        }
    }
}
