//! One timestamped resource-usage sample for a process tree.
//!
//! Fields keep their insertion order, which becomes the column order when a
//! reading is the first to introduce a key into the CSV header.

use std::fmt;

/// A single metric value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(u64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
        }
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(f64::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

/// An ordered, sparse mapping from metric name to value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reading {
    fields: Vec<(String, Value)>,
}

impl Reading {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field. An existing key keeps its position and takes the new value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_preserves_order() {
        let mut r = Reading::new();
        r.insert("gpu_0_name", "A100");
        r.insert("cpu_usage", 12.5_f64);
        r.insert("timestamp", "now");
        let keys: Vec<_> = r.keys().collect();
        assert_eq!(keys, vec!["gpu_0_name", "cpu_usage", "timestamp"]);
    }

    #[test]
    fn test_insert_existing_key_replaces_in_place() {
        let mut r = Reading::new();
        r.insert("a", 1_u64);
        r.insert("b", 2_u64);
        r.insert("a", 3_u64);
        assert_eq!(r.len(), 2);
        assert_eq!(r.keys().next(), Some("a"));
        assert_eq!(r.get("a"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Int(42).to_string(), "42");
        assert_eq!(Value::Float(0.0).to_string(), "0");
        assert_eq!(Value::Float(12.5).to_string(), "12.5");
        assert_eq!(Value::from("[N/A]").to_string(), "[N/A]");
    }

    #[test]
    fn test_missing_key() {
        let r = Reading::new();
        assert!(r.is_empty());
        assert_eq!(r.get("cpu_usage"), None);
    }
}
