// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Internal value type for control-bus properties.
//!
//! Every property crossing the bus boundary is decoded into [`Value`] exactly
//! once. Business logic only ever sees this type, never the binding's own
//! variant representation.

use std::collections::BTreeMap;

/// Tagged union of everything the control bus can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    /// Key/value pairs in bus order. Keys may be integers or strings.
    Dict(Vec<(Value, Value)>),
    /// A nested variant wrapper.
    Variant(Box<Value>),
}

impl Value {
    /// Strip any number of variant wrappers.
    pub fn inner(&self) -> &Value {
        match self {
            Value::Variant(v) => v.inner(),
            other => other,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.inner() {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self.inner() {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.inner() {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Normalise to a plain byte array.
    ///
    /// Accepts raw bytes, arrays of small integers and arrays of nested
    /// byte-like values (which are concatenated).
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        match self.inner() {
            Value::Bytes(b) => Some(b.clone()),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item.inner() {
                        Value::Int(i) => out.push(u8::try_from(*i).ok()?),
                        other => out.extend(other.to_bytes()?),
                    }
                }
                Some(out)
            }
            Value::Str(s) => Some(s.as_bytes().to_vec()),
            _ => None,
        }
    }

    /// Normalise a dictionary of byte payloads into `key → bytes`.
    ///
    /// Keys are rendered as strings (integer keys in decimal). Entries whose
    /// value cannot be normalised are skipped.
    pub fn to_byte_map(&self) -> BTreeMap<String, Vec<u8>> {
        let mut out = BTreeMap::new();
        if let Value::Dict(entries) = self.inner() {
            for (key, value) in entries {
                let key = match key.inner() {
                    Value::Int(i) => i.to_string(),
                    Value::Str(s) => s.clone(),
                    _ => continue,
                };
                if let Some(bytes) = value.to_bytes() {
                    out.insert(key, bytes);
                }
            }
        }
        out
    }

    /// Normalise an array of strings.
    pub fn to_string_list(&self) -> Vec<String> {
        match self.inner() {
            Value::Array(items) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Value::Str(s) => vec![s.clone()],
            _ => Vec::new(),
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

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}
