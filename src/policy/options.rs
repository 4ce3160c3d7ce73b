//! Flat key/value policy options
//!
//! Values arrive as loosely typed JSON. The typed getters accept the forms
//! operators actually write: durations as seconds or `"500ms"`, booleans as
//! `"yes"`/`"on"`/`1`, integers as numeric strings.

use super::PolicyError;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Raw option set for one listener
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Options(HashMap<String, Value>);

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from key/value pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Parse a JSON object
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("policy options must be a JSON object")
    }

    /// Load a JSON object from a file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read policy {}", path.display()))?;
        Self::from_json(&data).with_context(|| format!("invalid policy {}", path.display()))
    }

    /// Set a value, builder style
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First non-null value among `keys`, with the key it was found under
    pub fn get(&self, keys: &[&'static str]) -> Option<(&'static str, &Value)> {
        keys.iter()
            .find_map(|k| self.0.get(*k).filter(|v| !v.is_null()).map(|v| (*k, v)))
    }

    /// String value; numbers and booleans are rendered as text
    pub fn get_string(&self, keys: &[&'static str]) -> Result<Option<String>, PolicyError> {
        let Some((key, value)) = self.get(keys) else {
            return Ok(None);
        };
        match value {
            Value::String(s) => Ok(Some(s.trim().to_string()).filter(|s| !s.is_empty())),
            Value::Number(n) => Ok(Some(n.to_string())),
            Value::Bool(b) => Ok(Some(b.to_string())),
            _ => Err(PolicyError::configuration(key, "expected a string")),
        }
    }

    pub fn get_bool(&self, key: &'static str) -> Result<Option<bool>, PolicyError> {
        let Some((key, value)) = self.get(&[key]) else {
            return Ok(None);
        };
        match value {
            Value::Bool(b) => Ok(Some(*b)),
            Value::Number(n) => Ok(Some(n.as_f64().is_some_and(|f| f != 0.0))),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(Some(true)),
                "false" | "0" | "no" | "off" | "" => Ok(Some(false)),
                other => Err(PolicyError::configuration(
                    key,
                    format!("expected a boolean, got {other:?}"),
                )),
            },
            _ => Err(PolicyError::configuration(key, "expected a boolean")),
        }
    }

    pub fn get_int(&self, key: &'static str) -> Result<Option<i64>, PolicyError> {
        let Some((key, value)) = self.get(&[key]) else {
            return Ok(None);
        };
        match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(Some)
                .ok_or_else(|| PolicyError::configuration(key, "expected an integer")),
            Value::String(s) => s.trim().parse::<i64>().map(Some).map_err(|_| {
                PolicyError::configuration(key, format!("expected an integer, got {s:?}"))
            }),
            _ => Err(PolicyError::configuration(key, "expected an integer")),
        }
    }

    /// Duration value; negative inputs resolve to zero
    pub fn get_duration(&self, key: &'static str) -> Result<Option<Duration>, PolicyError> {
        let Some((key, value)) = self.get(&[key]) else {
            return Ok(None);
        };
        match value {
            Value::Number(n) => n
                .as_f64()
                .and_then(seconds)
                .map(Some)
                .ok_or_else(|| PolicyError::configuration(key, "expected a duration")),
            Value::String(s) => parse_duration(s).map(Some).ok_or_else(|| {
                PolicyError::configuration(key, format!("expected a duration, got {s:?}"))
            }),
            _ => Err(PolicyError::configuration(key, "expected a duration")),
        }
    }
}

fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Some(Duration::ZERO);
    }
    if s.starts_with('-') {
        return Some(Duration::ZERO);
    }
    if let Ok(secs) = s.parse::<f64>() {
        return seconds(secs);
    }
    humantime::parse_duration(s).ok()
}

fn seconds(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs.max(0.0)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_duration_forms() {
        let options = Options::new()
            .with("a", 5)
            .with("b", 1.5)
            .with("c", "250ms")
            .with("d", "2m")
            .with("e", "-3s")
            .with("f", "10");

        assert_eq!(options.get_duration("a").unwrap(), Some(Duration::from_secs(5)));
        assert_eq!(
            options.get_duration("b").unwrap(),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(
            options.get_duration("c").unwrap(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(options.get_duration("d").unwrap(), Some(Duration::from_secs(120)));
        assert_eq!(options.get_duration("e").unwrap(), Some(Duration::ZERO));
        assert_eq!(options.get_duration("f").unwrap(), Some(Duration::from_secs(10)));
        assert_eq!(options.get_duration("missing").unwrap(), None);
    }

    #[test]
    fn test_bad_duration_names_key() {
        let options = Options::new().with("observePeriod", "soon");
        match options.get_duration("observePeriod") {
            Err(PolicyError::Configuration { key, .. }) => assert_eq!(key, "observePeriod"),
            other => panic!("Expected Configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_bool_forms() {
        let options = Options::from_pairs([
            ("a", json!(true)),
            ("b", json!("yes")),
            ("c", json!("off")),
            ("d", json!(1)),
            ("e", json!("maybe")),
        ]);

        assert_eq!(options.get_bool("a").unwrap(), Some(true));
        assert_eq!(options.get_bool("b").unwrap(), Some(true));
        assert_eq!(options.get_bool("c").unwrap(), Some(false));
        assert_eq!(options.get_bool("d").unwrap(), Some(true));
        assert!(options.get_bool("e").is_err());
    }

    #[test]
    fn test_int_forms() {
        let options = Options::new().with("a", 4096).with("b", " 512 ").with("c", "x");
        assert_eq!(options.get_int("a").unwrap(), Some(4096));
        assert_eq!(options.get_int("b").unwrap(), Some(512));
        assert!(options.get_int("c").is_err());
    }

    #[test]
    fn test_alias_lookup_and_empty_strings() {
        let options = Options::new()
            .with("mitm.caCertFile", "/etc/ca.pem")
            .with("mitm.alpn", "  ")
            .with("nulled", Value::Null);

        assert_eq!(
            options
                .get_string(&["mitm.certFile", "mitm.caCertFile"])
                .unwrap(),
            Some("/etc/ca.pem".to_string())
        );
        assert_eq!(options.get_string(&["mitm.alpn"]).unwrap(), None);
        assert_eq!(options.get_string(&["nulled"]).unwrap(), None);
    }

    #[test]
    fn test_from_json() {
        let options = Options::from_json(r#"{"sniffing": true, "readTimeout": "30s"}"#).unwrap();
        assert_eq!(options.len(), 2);
        assert!(Options::from_json("[1, 2]").is_err());
    }
}
