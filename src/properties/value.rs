//! Variant type for the property-access wire interface.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Value of a worker property as seen through Get/Set/GetAll.
///
/// Mirrors the D-Bus variant types the worker advertises: `b`, `s` and `a{ss}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Str(String),
    Map(BTreeMap<String, String>),
}

impl PropertyValue {
    /// Name of the variant type, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Bool(_) => "boolean",
            PropertyValue::Str(_) => "string",
            PropertyValue::Map(_) => "string map",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            PropertyValue::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::Str(s) => write!(f, "{:?}", s),
            PropertyValue::Map(m) => {
                f.write_str("{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{:?}: {:?}", k, v)?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Str(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Str(value.to_string())
    }
}

impl From<BTreeMap<String, String>> for PropertyValue {
    fn from(value: BTreeMap<String, String>) -> Self {
        PropertyValue::Map(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        assert_eq!(PropertyValue::from(true).as_bool(), Some(true));
        assert_eq!(PropertyValue::from("x").as_str(), Some("x"));
        assert!(PropertyValue::from("x").as_bool().is_none());

        let mut map = BTreeMap::new();
        map.insert("Version".to_string(), "1".to_string());
        let value = PropertyValue::from(map.clone());
        assert_eq!(value.as_map(), Some(&map));
        assert_eq!(value.type_name(), "string map");
    }

    #[test]
    fn test_display() {
        let mut map = BTreeMap::new();
        map.insert("A".to_string(), "1".to_string());
        map.insert("B".to_string(), "2".to_string());
        assert_eq!(PropertyValue::Map(map).to_string(), r#"{"A": "1", "B": "2"}"#);
        assert_eq!(PropertyValue::Bool(false).to_string(), "false");
    }

    #[test]
    fn test_untagged_json_shape() {
        let json = serde_json::to_string(&PropertyValue::Bool(true)).unwrap();
        assert_eq!(json, "true");

        let parsed: PropertyValue = serde_json::from_str(r#"{"Version":"2"}"#).unwrap();
        assert_eq!(parsed.as_map().unwrap()["Version"], "2");
    }
}
