//! GVK/GVR identity and the objects keyed by it.
//!
//! `Gvk`/`Gvr` are real types (rather than ad-hoc `group/version/kind`
//! string concatenation) used as map keys and in log fields throughout the
//! workspace; `Display` still produces that same `group/version/kind` form.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Group/Version/Kind: the primary identity of a resource type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    pub fn parse(key: &str) -> Option<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] => Some(Self::new("", *version, *kind)),
            [group, version, kind] => Some(Self::new(*group, *version, *kind)),
            _ => None,
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Group/Version/Resource: the plural form used in URLs. The schema
/// controller maintains the bijection between this and `Gvk`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gvr {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl fmt::Display for Gvr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

/// Identity of a cached object: `namespace/name` for namespaced kinds, `name`
/// for cluster-scoped ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<String>, name: impl Into<String>) -> Self {
        Self { namespace, name: name.into() }
    }

    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self { namespace: None, name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl std::str::FromStr for ObjectKey {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) => Ok(Self::new(Some(ns.to_string()), name)),
            None => Ok(Self::cluster_scoped(s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_display_matches_gvk_key_string_format() {
        assert_eq!(Gvk::new("", "v1", "Pod").to_string(), "v1/Pod");
        assert_eq!(Gvk::new("apps", "v1", "Deployment").to_string(), "apps/v1/Deployment");
    }

    #[test]
    fn gvk_parse_round_trips() {
        let g = Gvk::parse("apps/v1/Deployment").unwrap();
        assert_eq!(g.group, "apps");
        assert_eq!(g.to_string(), "apps/v1/Deployment");
        let g2 = Gvk::parse("v1/Pod").unwrap();
        assert_eq!(g2.group, "");
    }

    #[test]
    fn object_key_parses_namespaced_and_cluster_scoped() {
        let k: ObjectKey = "default/my-pod".parse().unwrap();
        assert_eq!(k.namespace.as_deref(), Some("default"));
        assert_eq!(k.name, "my-pod");
        let k2: ObjectKey = "my-node".parse().unwrap();
        assert!(k2.namespace.is_none());
    }
}
