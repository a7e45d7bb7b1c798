//! Polymorphic Codec
//!
//! Typed values encode directly through serde. Dynamically shaped values
//! bridged from a host platform ([`ForeignValue`]) go through [`normalize`]
//! first: the whole tree is converted to a `serde_json::Value`, and only then
//! encoded once at the top level. Leaves that have no JSON form are either
//! rejected with their path or skipped and reported, never dropped silently.

use std::collections::HashSet;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Number, Value};

use crate::error::{Error, Result};

/// Encode a typed value
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode a typed value
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::Decode(e.to_string()))
}

/// Dynamically typed value from a foreign container
#[derive(Debug, Clone, PartialEq)]
pub enum ForeignValue {
    Null,
    Bool(bool),
    Integer(i64),
    Unsigned(u64),
    /// May be non-finite
    Float(f64),
    String(String),
    /// Raw bytes, encoded as base64
    Data(Vec<u8>),
    /// Instant, encoded as RFC 3339
    Date(DateTime<Utc>),
    Array(Vec<ForeignValue>),
    /// Ordered map whose keys need not be strings
    Dictionary(Vec<(ForeignValue, ForeignValue)>),
    /// Boxed scalar (e.g. a number object)
    Boxed(Box<ForeignValue>),
    /// Object with no data representation, described by its type name
    Opaque(String),
}

impl From<Value> for ForeignValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => ForeignValue::Null,
            Value::Bool(b) => ForeignValue::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ForeignValue::Integer(i)
                } else if let Some(u) = n.as_u64() {
                    ForeignValue::Unsigned(u)
                } else {
                    ForeignValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => ForeignValue::String(s),
            Value::Array(items) => ForeignValue::Array(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => ForeignValue::Dictionary(
                map.into_iter()
                    .map(|(k, v)| (ForeignValue::String(k), v.into()))
                    .collect(),
            ),
        }
    }
}

/// What to do with a leaf that has no JSON form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeafPolicy {
    /// Fail on the first such leaf
    #[default]
    Reject,
    /// Drop it and report its path
    Skip,
}

/// Result of [`normalize`]
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub value: Value,
    /// Paths of skipped leaves, in traversal order
    pub skipped: Vec<String>,
}

impl Normalized {
    /// Encode the normalized tree
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(&self.value)
    }
}

/// Convert a foreign tree into a JSON value.
///
/// A root that cannot be encoded fails under either policy since there is
/// nothing left to store.
pub fn normalize(value: &ForeignValue, policy: LeafPolicy) -> Result<Normalized> {
    let mut normalizer = Normalizer {
        policy,
        skipped: Vec::new(),
    };
    let root = "$".to_string();
    match normalizer.value(value, &root)? {
        Some(value) => Ok(Normalized {
            value,
            skipped: normalizer.skipped,
        }),
        None => Err(Error::Unencodable {
            path: root,
            reason: "root value has no JSON form".to_string(),
        }),
    }
}

struct Normalizer {
    policy: LeafPolicy,
    skipped: Vec<String>,
}

impl Normalizer {
    /// `Ok(None)` means the leaf was skipped
    fn unencodable(&mut self, path: &str, reason: String) -> Result<Option<Value>> {
        match self.policy {
            LeafPolicy::Reject => Err(Error::Unencodable {
                path: path.to_string(),
                reason,
            }),
            LeafPolicy::Skip => {
                self.skipped.push(path.to_string());
                Ok(None)
            }
        }
    }

    fn value(&mut self, value: &ForeignValue, path: &str) -> Result<Option<Value>> {
        let normalized = match value {
            ForeignValue::Null => Value::Null,
            ForeignValue::Bool(b) => Value::Bool(*b),
            ForeignValue::Integer(i) => Value::from(*i),
            ForeignValue::Unsigned(u) => Value::from(*u),
            ForeignValue::Float(f) => match Number::from_f64(*f) {
                Some(n) => Value::Number(n),
                None => return self.unencodable(path, format!("non-finite number {f}")),
            },
            ForeignValue::String(s) => Value::String(s.clone()),
            ForeignValue::Data(bytes) => Value::String(STANDARD.encode(bytes)),
            ForeignValue::Date(at) => Value::String(at.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            ForeignValue::Boxed(inner) => return self.value(inner, path),
            ForeignValue::Opaque(type_name) => {
                return self.unencodable(path, format!("opaque object of type {type_name}"))
            }
            ForeignValue::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    if let Some(v) = self.value(item, &format!("{path}[{i}]"))? {
                        out.push(v);
                    }
                }
                Value::Array(out)
            }
            ForeignValue::Dictionary(entries) => {
                let mut out = Map::new();
                let mut seen = HashSet::new();
                for (i, (k, v)) in entries.iter().enumerate() {
                    let Some(key) = dictionary_key(k) else {
                        let entry_path = format!("{path}{{key #{i}}}");
                        self.unencodable(&entry_path, format!("dictionary key {} has no string form", describe(k)))?;
                        continue;
                    };
                    let entry_path = format!("{path}.{key}");
                    if !seen.insert(key.clone()) {
                        self.unencodable(&entry_path, "duplicate dictionary key after conversion".to_string())?;
                        continue;
                    }
                    if let Some(v) = self.value(v, &entry_path)? {
                        out.insert(key, v);
                    }
                }
                Value::Object(out)
            }
        };
        Ok(Some(normalized))
    }
}

/// String form of a dictionary key, if it has one
fn dictionary_key(key: &ForeignValue) -> Option<String> {
    match key {
        ForeignValue::String(s) => Some(s.clone()),
        ForeignValue::Bool(b) => Some(b.to_string()),
        ForeignValue::Integer(i) => Some(i.to_string()),
        ForeignValue::Unsigned(u) => Some(u.to_string()),
        ForeignValue::Float(f) if f.is_finite() => Some(f.to_string()),
        ForeignValue::Date(at) => Some(at.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        ForeignValue::Boxed(inner) => dictionary_key(inner),
        _ => None,
    }
}

fn describe(value: &ForeignValue) -> &'static str {
    match value {
        ForeignValue::Null => "null",
        ForeignValue::Bool(_) => "bool",
        ForeignValue::Integer(_) | ForeignValue::Unsigned(_) => "integer",
        ForeignValue::Float(_) => "float",
        ForeignValue::String(_) => "string",
        ForeignValue::Data(_) => "data",
        ForeignValue::Date(_) => "date",
        ForeignValue::Array(_) => "array",
        ForeignValue::Dictionary(_) => "dictionary",
        ForeignValue::Boxed(_) => "boxed value",
        ForeignValue::Opaque(_) => "opaque object",
    }
}
