//! Dynamic values carried by generic calls, check commands, and request contexts.

use crate::error::{CodecError, CodecResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A dynamically typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    ///
    /// BCS has no float encoding, so the IEEE-754 bits travel as a `u64`.
    Float(#[serde(with = "float_bits")] f64),
    /// UTF-8 string.
    Str(String),
    /// Opaque bytes.
    Blob(Vec<u8>),
    /// Ordered list.
    List(Vec<Value>),
    /// String-keyed dictionary.
    Dict(Arguments),
}

mod float_bits {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.to_bits())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        u64::deserialize(deserializer).map(f64::from_bits)
    }
}

impl Value {
    /// Return the string slice if this is a [`Value::Str`].
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Return the integer if this is a [`Value::Int`].
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Return the bytes if this is a [`Value::Blob`].
    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(b) => Some(b),
            _ => None,
        }
    }

    /// Return the dictionary if this is a [`Value::Dict`].
    pub fn as_dict(&self) -> Option<&Arguments> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Blob(value)
    }
}

impl From<Arguments> for Value {
    fn from(value: Arguments) -> Self {
        Self::Dict(value)
    }
}

/// A string-keyed dictionary of [`Value`]s.
///
/// Used as the raw argument and result shape of generic calls, the field set of check
/// commands, and the failure payload of exceptional answers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Arguments(BTreeMap<String, Value>);

impl Arguments {
    /// Create an empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a field.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder-style [`Self::set`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Look up a field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String field, or an empty string when absent or not a string.
    pub fn get_string(&self, key: &str) -> String {
        self.get(key).and_then(Value::as_str).map(str::to_string).unwrap_or_default()
    }

    /// Integer field, or zero when absent or not an integer.
    pub fn get_int(&self, key: &str) -> i64 {
        self.get(key).and_then(Value::as_int).unwrap_or_default()
    }

    /// Required string field.
    pub fn require_str(&self, key: &str) -> CodecResult<&str> {
        self.get(key).and_then(Value::as_str).ok_or_else(|| field_error(key, "string"))
    }

    /// Required integer field.
    pub fn require_int(&self, key: &str) -> CodecResult<i64> {
        self.get(key).and_then(Value::as_int).ok_or_else(|| field_error(key, "integer"))
    }

    /// Required blob field.
    pub fn require_blob(&self, key: &str) -> CodecResult<&[u8]> {
        self.get(key).and_then(Value::as_blob).ok_or_else(|| field_error(key, "blob"))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no fields are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

fn field_error(field: &str, expected: &'static str) -> CodecError {
    CodecError::Field { field: field.to_string(), expected }
}

impl FromIterator<(String, Value)> for Arguments {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Request metadata sent with every quest.
///
/// Unlike [`Arguments`], entries keep the order they were inserted in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context(Vec<(String, Value)>);

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key, replacing the value in place if the key exists.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.0.push((key, value)),
        }
    }

    /// Builder-style [`Self::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Look up a key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// True when no entries are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}
