//! The canonical cached-object shape.

use crate::gvk::ObjectKey;
use crate::value::Value;
use serde_json::Value as Json;

/// An `unstructured` Kubernetes object: `apiVersion`/`kind` plus a metadata
/// sub-map and arbitrary `spec`/`status`/top-level fields.
#[derive(Debug, Clone)]
pub struct CachedObject {
    pub value: Value,
}

impl CachedObject {
    pub fn from_json(json: Json) -> Self {
        Self { value: Value::from(json) }
    }

    pub fn into_json(self) -> Json {
        self.value.into()
    }

    pub fn name(&self) -> Option<&str> {
        self.value.get_path(&["metadata", "name"]).and_then(Value::as_str)
    }

    pub fn namespace(&self) -> Option<&str> {
        self.value.get_path(&["metadata", "namespace"]).and_then(Value::as_str)
    }

    pub fn uid(&self) -> Option<&str> {
        self.value.get_path(&["metadata", "uid"]).and_then(Value::as_str)
    }

    /// Opaque monotonic token used for watch resumption.
    pub fn resource_version(&self) -> Option<&str> {
        self.value.get_path(&["metadata", "resourceVersion"]).and_then(Value::as_str)
    }

    pub fn creation_timestamp(&self) -> Option<&str> {
        self.value.get_path(&["metadata", "creationTimestamp"]).and_then(Value::as_str)
    }

    pub fn labels(&self) -> Vec<(&str, &str)> {
        self.value
            .get_path(&["metadata", "labels"])
            .and_then(Value::as_object)
            .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.as_str(), s))).collect())
            .unwrap_or_default()
    }

    pub fn annotations(&self) -> Vec<(&str, &str)> {
        self.value
            .get_path(&["metadata", "annotations"])
            .and_then(Value::as_object)
            .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.as_str(), s))).collect())
            .unwrap_or_default()
    }

    pub fn api_version(&self) -> Option<&str> {
        self.value.get_path(&["apiVersion"]).and_then(Value::as_str)
    }

    pub fn kind(&self) -> Option<&str> {
        self.value.get_path(&["kind"]).and_then(Value::as_str)
    }

    /// `namespace/name` (namespaced) or `name` (cluster-scoped); the row
    /// identity used as the `objects.key` primary key.
    pub fn object_key(&self) -> Option<ObjectKey> {
        let name = self.name()?;
        Some(ObjectKey::new(self.namespace().map(|s| s.to_string()), name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(name: &str, ns: &str) -> CachedObject {
        CachedObject::from_json(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": ns,
                "uid": "abc-123",
                "resourceVersion": "42",
                "labels": {"app": "web"},
                "creationTimestamp": "2024-01-01T00:00:00Z",
            }
        }))
    }

    #[test]
    fn extracts_identity_fields() {
        let o = pod("alpha", "default");
        assert_eq!(o.name(), Some("alpha"));
        assert_eq!(o.namespace(), Some("default"));
        assert_eq!(o.resource_version(), Some("42"));
        assert_eq!(o.object_key().unwrap().to_string(), "default/alpha");
        assert_eq!(o.labels(), vec![("app", "web")]);
    }

    #[test]
    fn cluster_scoped_object_key_has_no_namespace() {
        let o = CachedObject::from_json(serde_json::json!({
            "apiVersion": "v1", "kind": "Node",
            "metadata": {"name": "node-1"}
        }));
        let key = o.object_key().unwrap();
        assert!(key.namespace.is_none());
        assert_eq!(key.to_string(), "node-1");
    }
}
