//! The dynamic object tree every filter, sorter, and projector walks.
//!
//! Kubernetes resources are schema-less at this layer: a `Value` is a
//! tagged tree with O(1) field access by path segment.
//! The conversion to/from `serde_json::Value` is the boundary where
//! `DynamicObject`s coming off the informer's watch stream enter the cache.

use indexmap::IndexMap;
use serde_json::Value as Json;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::String(s) => s.parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Object(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Field access by a pre-split path, e.g. `["metadata", "labels", "app"]`.
    pub fn get_path(&self, path: &[&str]) -> Option<&Value> {
        let mut cur = self;
        for seg in path {
            cur = match cur {
                Value::Object(m) => m.get(*seg)?,
                _ => return None,
            };
        }
        Some(cur)
    }

    /// Render a scalar value as a comparable/displayable string. Non-scalars
    /// return `None` — filters and sorts only operate on scalars.
    pub fn scalar_string(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(format_number(*n)),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Json::from(self.clone()))
    }
}

impl From<Json> for Value {
    fn from(j: Json) -> Self {
        match j {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            Json::String(s) => Value::String(s),
            Json::Array(a) => Value::Array(a.into_iter().map(Value::from).collect()),
            Json::Object(m) => {
                Value::Object(m.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for Json {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(b),
            Value::Number(n) => serde_json::Number::from_f64(n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::String(s) => Json::String(s),
            Value::Array(a) => Json::Array(a.into_iter().map(Json::from).collect()),
            Value::Object(m) => {
                Json::Object(m.into_iter().map(|(k, v)| (k, Json::from(v))).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let j = serde_json::json!({
            "metadata": {"name": "x", "labels": {"app": "web"}},
            "spec": {"replicas": 3, "paused": false, "tags": ["a", "b"]},
        });
        let v = Value::from(j.clone());
        let back: Json = v.into();
        assert_eq!(j, back);
    }

    #[test]
    fn get_path_walks_nested_objects() {
        let v = Value::from(serde_json::json!({"metadata": {"labels": {"app": "web"}}}));
        let found = v.get_path(&["metadata", "labels", "app"]).unwrap();
        assert_eq!(found.as_str(), Some("web"));
        assert!(v.get_path(&["metadata", "labels", "missing"]).is_none());
    }

    #[test]
    fn empty_array_survives_round_trip() {
        // Kubernetes distinguishes a present-but-empty list from an absent
        // field; the tree must not coerce `[]` into `Null` on the way back.
        let j = serde_json::json!({"spec": {"rules": []}});
        let v = Value::from(j.clone());
        let back: Json = v.into();
        assert_eq!(j, back);
    }
}
