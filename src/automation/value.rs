//! Context and payload value tree.
//!
//! Mirrors JSON but keeps datetimes as a first-class variant so that a lone
//! `{{ticket.created_at}}` token can carry a real instant into a payload and
//! only becomes an ISO-8601 string when the payload is serialized.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

/// A node of an automation context or rendered payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    DateTime(DateTime<Utc>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

/// Trigger-site context handed to filters and templates.
pub type Context = Value;

impl Value {
    /// An empty mapping.
    pub fn map() -> Self {
        Value::Map(BTreeMap::new())
    }

    /// Builder-style insert; turns `Null` into a mapping first.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert into a mapping. Non-mapping values are left untouched.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        if matches!(self, Value::Null) {
            *self = Value::map();
        }
        if let Value::Map(map) = self {
            map.insert(key.into(), value.into());
        }
    }

    /// Resolve a dotted path; numeric segments index into lists.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return None;
        }

        let mut current = self;
        for segment in path.split('.') {
            current = match current {
                Value::Map(map) => map.get(segment)?,
                Value::List(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Convert into plain JSON. Datetimes become ISO-8601 UTC strings.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::DateTime(dt) => serde_json::Value::String(format_datetime(dt)),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Text form used when a token is embedded inside a larger string.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            Value::DateTime(dt) => format_datetime(dt),
            Value::List(_) | Value::Map(_) => self.to_json().to_string(),
        }
    }

    /// Loose equality: numbers compare numerically, everything else
    /// structurally.
    pub fn loosely_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => a == b,
            },
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loosely_equals(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a
                        .iter()
                        .all(|(k, v)| b.get(k).is_some_and(|w| v.loosely_equals(w)))
            }
            _ => self == other,
        }
    }
}

/// ISO-8601 rendering used throughout payloads and envelopes.
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&serde_json::Value> for Value {
    fn from(value: &serde_json::Value) -> Self {
        Value::from(value.clone())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(dt: DateTime<Utc>) -> Self {
        Value::DateTime(dt)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_path_resolution() {
        let ctx = Value::from(json!({
            "ticket": {"id": 7, "labels": ["a", "b"], "requester": {"email": "x@example.com"}}
        }));

        assert_eq!(ctx.get_path("ticket.id"), Some(&Value::from(7i64)));
        assert_eq!(ctx.get_path("ticket.labels.1"), Some(&Value::from("b")));
        assert_eq!(
            ctx.get_path("ticket.requester.email").and_then(Value::as_str),
            Some("x@example.com")
        );
        assert!(ctx.get_path("ticket.labels.9").is_none());
        assert!(ctx.get_path("ticket.id.deeper").is_none());
        assert!(ctx.get_path("").is_none());
    }

    #[test]
    fn test_datetime_serializes_with_utc_offset() {
        let dt = Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap();
        let value = Value::map().with("at", dt);
        assert_eq!(value.to_json(), json!({"at": "2025-03-01T09:30:00+00:00"}));
        assert_eq!(Value::from(dt).to_display_string(), "2025-03-01T09:30:00+00:00");
    }

    #[test]
    fn test_loose_number_equality() {
        assert!(Value::from(json!(3)).loosely_equals(&Value::from(json!(3.0))));
        assert!(!Value::from(json!("3")).loosely_equals(&Value::from(json!(3))));
    }

    #[test]
    fn test_json_roundtrip_without_datetimes() {
        let original = json!({"a": [1, "two", null, {"b": true}]});
        assert_eq!(Value::from(original.clone()).to_json(), original);
    }
}
