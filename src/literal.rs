//! Literal codec for command payloads.
//!
//! Values are restricted to strings, integers, booleans, none, sequences and
//! string-keyed mappings. The text form is compact JSON, which escapes every
//! control character, so an encoded literal is always a single line with no
//! raw NUL byte. Decoding only ever builds one of those six kinds; anything
//! else (floats, trailing garbage, bare words) is rejected outright.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A decoded literal value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Str(String),
    Seq(Vec<Literal>),
    Map(BTreeMap<String, Literal>),
}

impl Literal {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Literal::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Literal::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Literal::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Literal]> {
        match self {
            Literal::Seq(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Literal>> {
        match self {
            Literal::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Literal::None)
    }

    /// Sequence of strings, e.g. an argv.
    pub fn to_strings(&self) -> Option<Vec<String>> {
        self.as_seq()?
            .iter()
            .map(|item| item.as_str().map(str::to_owned))
            .collect()
    }

    /// Mapping of string to string, e.g. an environment.
    pub fn to_string_map(&self) -> Option<BTreeMap<String, String>> {
        self.as_map()?
            .iter()
            .map(|(key, value)| value.as_str().map(|v| (key.clone(), v.to_owned())))
            .collect()
    }
}

impl From<&str> for Literal {
    fn from(s: &str) -> Self {
        Literal::Str(s.to_owned())
    }
}

impl From<String> for Literal {
    fn from(s: String) -> Self {
        Literal::Str(s)
    }
}

impl From<i64> for Literal {
    fn from(i: i64) -> Self {
        Literal::Int(i)
    }
}

impl From<bool> for Literal {
    fn from(b: bool) -> Self {
        Literal::Bool(b)
    }
}

impl<T: Into<Literal>> From<Vec<T>> for Literal {
    fn from(items: Vec<T>) -> Self {
        Literal::Seq(items.into_iter().map(Into::into).collect())
    }
}

impl<V: Into<Literal>> From<BTreeMap<String, V>> for Literal {
    fn from(map: BTreeMap<String, V>) -> Self {
        Literal::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl<T: Into<Literal>> From<Option<T>> for Literal {
    fn from(value: Option<T>) -> Self {
        value.map_or(Literal::None, Into::into)
    }
}

/// Encode a literal as a single line of text.
pub fn encode(value: &Literal) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::MalformedLiteral(e.to_string()))
}

/// Decode text produced by [`encode`].
pub fn decode(text: &str) -> Result<Literal> {
    serde_json::from_str(text).map_err(|e| Error::MalformedLiteral(e.to_string()))
}
