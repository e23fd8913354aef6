//! Recipe option tables and their canonical serialization.
//!
//! Two recipes with the same identity but different options are distinct
//! graph nodes, so the serialized form must be byte-stable: keys in
//! lexicographic order, no insignificant whitespace. We keep the table in a
//! `BTreeMap` and serialize through the JSON canonicalizer (RFC 8785) so the
//! bytes are identical across platforms and serde versions.

use crate::error::OptionError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single option value. Manifests only produce scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// An ordered option table. Iteration order is key order, which is also the
/// canonical serialization order.
pub type OptionTable = BTreeMap<String, OptionValue>;

/// Serialize an option table to its canonical byte string.
///
/// An empty table serializes to the empty string (not `{}`), so keys of
/// option-less recipes stay equal to their bare identity.
pub fn serialize_options(options: &OptionTable) -> Result<String, OptionError> {
    if options.is_empty() {
        return Ok(String::new());
    }
    let value =
        serde_json::to_value(options).map_err(|e| OptionError::BadOptionSerialization {
            reason: e.to_string(),
        })?;
    serde_json_canonicalizer::to_string(&value).map_err(|e| {
        OptionError::BadOptionSerialization {
            reason: e.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_table_serializes_to_empty_string() {
        assert_eq!(serialize_options(&OptionTable::new()).unwrap(), "");
    }

    #[test]
    fn test_serialization_sorts_keys() {
        let mut opts = OptionTable::new();
        opts.insert("zlib".into(), OptionValue::Bool(true));
        opts.insert("arch".into(), OptionValue::Str("armv7".into()));
        opts.insert("jobs".into(), OptionValue::Int(4));

        let s = serialize_options(&opts).unwrap();
        assert_eq!(s, r#"{"arch":"armv7","jobs":4,"zlib":true}"#);
    }

    #[test]
    fn test_serialization_has_no_whitespace() {
        let mut opts = OptionTable::new();
        opts.insert("a".into(), OptionValue::Str("b c".into()));
        let s = serialize_options(&opts).unwrap();
        assert!(!s.contains(": "));
        assert!(!s.contains(", "));
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let mut forward = OptionTable::new();
        forward.insert("a".into(), OptionValue::Int(1));
        forward.insert("b".into(), OptionValue::Int(2));

        let mut backward = OptionTable::new();
        backward.insert("b".into(), OptionValue::Int(2));
        backward.insert("a".into(), OptionValue::Int(1));

        assert_eq!(
            serialize_options(&forward).unwrap(),
            serialize_options(&backward).unwrap()
        );
    }
}
