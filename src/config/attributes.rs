//! Typed attribute lookup over layered config sources.
//!
//! Phase and job tunables live in loosely typed bags. Every read goes
//! through [`resolve`] or [`resolve_optional`], which walk an ordered list of
//! `(source, key)` pairs and return the first present value, converted and
//! type-checked.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::ConfigError;

/// A bag of tunables for one phase, job type, or the global constants.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeBag(BTreeMap<String, toml::Value>);

impl AttributeBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn empty() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&toml::Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Insert or replace a value. Used for in-memory injections only.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<toml::Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<toml::Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Render as JSON for handing to external programs.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.0).unwrap_or(serde_json::Value::Null)
    }
}

/// A named bag participating in a resolution chain.
#[derive(Debug, Clone, Copy)]
pub struct AttributeSource<'a> {
    pub location: &'a str,
    pub bag: &'a AttributeBag,
}

impl<'a> AttributeSource<'a> {
    pub fn new(location: &'a str, bag: &'a AttributeBag) -> Self {
        Self { location, bag }
    }
}

/// Conversion from a raw attribute value.
///
/// String forms are accepted for every scalar type because upstream
/// tooling writes numbers and flags as strings.
pub trait FromAttribute: Sized {
    const EXPECTED: &'static str;

    fn from_attribute(value: &toml::Value) -> Option<Self>;
}

impl FromAttribute for u64 {
    const EXPECTED: &'static str = "non-negative integer";

    fn from_attribute(value: &toml::Value) -> Option<Self> {
        match value {
            toml::Value::Integer(i) => u64::try_from(*i).ok(),
            toml::Value::Float(f) if *f >= 0.0 && f.fract() == 0.0 && f.is_finite() => {
                Some(*f as u64)
            }
            toml::Value::String(s) => {
                let s = s.trim();
                s.parse::<u64>().ok().or_else(|| {
                    s.parse::<f64>()
                        .ok()
                        .filter(|f| *f >= 0.0 && f.fract() == 0.0 && f.is_finite())
                        .map(|f| f as u64)
                })
            }
            _ => None,
        }
    }
}

impl FromAttribute for u32 {
    const EXPECTED: &'static str = "non-negative integer";

    fn from_attribute(value: &toml::Value) -> Option<Self> {
        u64::from_attribute(value).and_then(|v| u32::try_from(v).ok())
    }
}

impl FromAttribute for usize {
    const EXPECTED: &'static str = "non-negative integer";

    fn from_attribute(value: &toml::Value) -> Option<Self> {
        u64::from_attribute(value).and_then(|v| usize::try_from(v).ok())
    }
}

impl FromAttribute for f64 {
    const EXPECTED: &'static str = "number";

    fn from_attribute(value: &toml::Value) -> Option<Self> {
        let parsed = match value {
            toml::Value::Integer(i) => Some(*i as f64),
            toml::Value::Float(f) => Some(*f),
            toml::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        parsed.filter(|f: &f64| f.is_finite())
    }
}

impl FromAttribute for bool {
    const EXPECTED: &'static str = "boolean";

    fn from_attribute(value: &toml::Value) -> Option<Self> {
        match value {
            toml::Value::Boolean(b) => Some(*b),
            toml::Value::Integer(i) => Some(*i != 0),
            toml::Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => Some(true),
                "0" | "false" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl FromAttribute for String {
    const EXPECTED: &'static str = "string";

    fn from_attribute(value: &toml::Value) -> Option<Self> {
        match value {
            toml::Value::String(s) => Some(s.clone()),
            toml::Value::Integer(i) => Some(i.to_string()),
            toml::Value::Float(f) => Some(f.to_string()),
            toml::Value::Boolean(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

/// Coefficient lists, either as an array or as a whitespace separated string.
impl FromAttribute for Vec<f64> {
    const EXPECTED: &'static str = "list of numbers";

    fn from_attribute(value: &toml::Value) -> Option<Self> {
        match value {
            toml::Value::Array(items) => items.iter().map(f64::from_attribute).collect(),
            toml::Value::String(s) => s
                .split(|c: char| c.is_whitespace() || c == ',')
                .filter(|t| !t.is_empty())
                .map(|t| t.parse::<f64>().ok().filter(|f| f.is_finite()))
                .collect(),
            _ => None,
        }
    }
}

/// Return the first value present along `chain`, or `None` when no source has it.
///
/// A present value of the wrong type is an error, never skipped.
pub fn resolve_optional<T: FromAttribute>(
    chain: &[(AttributeSource<'_>, &str)],
) -> Result<Option<T>, ConfigError> {
    for (source, key) in chain {
        if let Some(raw) = source.bag.get(key) {
            return T::from_attribute(raw)
                .map(Some)
                .ok_or_else(|| ConfigError::TypeMismatch {
                    location: source.location.to_string(),
                    key: key.to_string(),
                    expected: T::EXPECTED,
                });
        }
    }
    Ok(None)
}

/// Like [`resolve_optional`] with a fallback default.
pub fn resolve<T: FromAttribute>(
    chain: &[(AttributeSource<'_>, &str)],
    default: T,
) -> Result<T, ConfigError> {
    Ok(resolve_optional(chain)?.unwrap_or(default))
}

/// Like [`resolve_optional`] but absence is a `ConfigError::Missing`.
pub fn resolve_required<T: FromAttribute>(
    chain: &[(AttributeSource<'_>, &str)],
) -> Result<T, ConfigError> {
    resolve_optional(chain)?.ok_or_else(|| {
        let (source, key) = chain
            .last()
            .map(|(s, k)| (s.location.to_string(), k.to_string()))
            .unwrap_or_default();
        ConfigError::Missing {
            location: source,
            key,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bag(pairs: &[(&str, toml::Value)]) -> AttributeBag {
        let mut bag = AttributeBag::new();
        for (k, v) in pairs {
            bag.set(*k, v.clone());
        }
        bag
    }

    #[test]
    fn test_resolve_returns_first_present() {
        let job = bag(&[]);
        let phase = bag(&[("default_memory", toml::Value::Integer(5))]);
        let constants = bag(&[("default_memory", toml::Value::Integer(9))]);
        let chain = [
            (AttributeSource::new("jobs.X", &job), "memory"),
            (AttributeSource::new("phases.bar", &phase), "default_memory"),
            (AttributeSource::new("constants", &constants), "default_memory"),
        ];
        let value: u64 = resolve(&chain, 0).unwrap();
        assert_eq!(value, 5);
    }

    #[test]
    fn test_resolve_falls_back_to_default() {
        let empty = bag(&[]);
        let chain = [(AttributeSource::new("phases.caf", &empty), "iterations")];
        assert_eq!(resolve::<u32>(&chain, 7).unwrap(), 7);
        assert_eq!(resolve_optional::<u32>(&chain).unwrap(), None);
    }

    #[test]
    fn test_resolve_type_mismatch_is_error() {
        let b = bag(&[("max_group_size", toml::Value::String("lots".into()))]);
        let chain = [(AttributeSource::new("phases.bar", &b), "max_group_size")];
        let err = resolve::<u64>(&chain, 1).unwrap_err();
        match err {
            ConfigError::TypeMismatch { location, key, .. } => {
                assert_eq!(location, "phases.bar");
                assert_eq!(key, "max_group_size");
            }
            other => panic!("Expected TypeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_required_reports_last_location() {
        let a = bag(&[]);
        let chain = [(AttributeSource::new("phases.hal", &a), "reference")];
        let err = resolve_required::<String>(&chain).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { key, .. } if key == "reference"));
    }

    #[test]
    fn test_string_forms() {
        assert_eq!(bool::from_attribute(&"1".into()), Some(true));
        assert_eq!(bool::from_attribute(&"false".into()), Some(false));
        assert_eq!(u64::from_attribute(&"1e6".into()), Some(1_000_000));
        assert_eq!(u64::from_attribute(&toml::Value::Integer(-1)), None);
        assert_eq!(
            Vec::<f64>::from_attribute(&"2.5e9 0.5".into()),
            Some(vec![2.5e9, 0.5])
        );
        assert_eq!(Vec::<f64>::from_attribute(&"2.5e9 x".into()), None);
    }
}
