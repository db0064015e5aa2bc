//! Computes and caches per-user `AccessSet`s from RBAC role-bindings.
//!
//! Grants are derived locally from watched `RoleBinding`/`ClusterRoleBinding`/
//! `Role`/`ClusterRole` objects, using the `k8s_openapi::api::rbac::v1`
//! shapes, rather than asking the API server per-request.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, Subject};
use rustc_hash::FxHasher;
use tracing::debug;

/// An identity the access set is computed for: a username plus the groups it
/// belongs to (subjects of kind `User` or `Group` both apply).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct User {
    pub name: String,
    pub groups: Vec<String>,
}

impl User {
    pub fn new(name: impl Into<String>, groups: Vec<String>) -> Self {
        Self { name: name.into(), groups }
    }

    fn is_subject(&self, subject: &Subject) -> bool {
        match subject.kind.as_str() {
            "User" => subject.name == self.name,
            "Group" => self.groups.iter().any(|g| g == &subject.name),
            // ServiceAccount subjects are matched by the caller normalizing
            // the identity to "system:serviceaccount:<ns>:<name>" as `name`.
            "ServiceAccount" => subject.name == self.name,
            _ => false,
        }
    }
}

/// Group/resource pair a policy rule grants verbs on. `"*"` in either field
/// means "every group"/"every resource", matched by [`AccessSet::grants`]
/// falling back to wildcard entries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupResource {
    pub group: String,
    pub resource: String,
}

impl GroupResource {
    pub fn new(group: impl Into<String>, resource: impl Into<String>) -> Self {
        Self { group: group.into(), resource: resource.into() }
    }
}

/// One policy rule's contribution to the set, already split by group and
/// resource: the verbs it grants and the scope (`namespace = None` means
/// cluster-wide, from a `ClusterRoleBinding`; `names = None` means every
/// name).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Grant {
    verbs: Vec<String>,
    namespace: Option<String>,
    names: Option<Vec<String>>,
}

impl Grant {
    fn allows_verb(&self, verb: &str) -> bool {
        self.verbs.iter().any(|v| v == "*" || v == verb)
    }

    fn allows_scope(&self, namespace: Option<&str>, name: &str) -> bool {
        let ns_ok = match (&self.namespace, namespace) {
            (None, _) => true, // cluster-wide grant
            (Some(g), Some(r)) => g == r,
            (Some(_), None) => false, // namespaced grant can't cover a cluster-scoped resource
        };
        let name_ok = self.names.as_ref().map_or(true, |names| names.iter().any(|n| n == name));
        ns_ok && name_ok
    }
}

/// Immutable per-user access snapshot: `(verb, GroupResource) -> [Grant]`,
/// plus a stable `id` two equal-by-content sets always share.
pub struct AccessSet {
    grants: BTreeMap<String, Vec<(GroupResource, Grant)>>,
    id: u64,
}

impl AccessSet {
    fn empty() -> Self {
        Self { grants: BTreeMap::new(), id: 0 }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// O(log N) in the number of distinct verbs seen, then a linear scan of
    /// that verb's (typically small) grant list.
    pub fn grants(&self, verb: &str, gr: &GroupResource, namespace: Option<&str>, name: &str) -> bool {
        let Some(entries) = self.grants.get(verb).or_else(|| self.grants.get("*")) else { return false };
        entries.iter().any(|(entry_gr, grant)| {
            let group_ok = entry_gr.group == "*" || entry_gr.group == gr.group;
            let resource_ok = entry_gr.resource == "*" || entry_gr.resource == gr.resource;
            group_ok && resource_ok && grant.allows_verb(verb) && grant.allows_scope(namespace, name)
        })
    }

    /// Whether `verb` on `gr` is unrestricted namespace-wide — i.e. the user
    /// may list the whole collection.
    pub fn is_passthrough(&self, verb: &str, gr: &GroupResource) -> bool {
        let Some(entries) = self.grants.get(verb).or_else(|| self.grants.get("*")) else { return false };
        entries.iter().any(|(entry_gr, grant)| {
            let group_ok = entry_gr.group == "*" || entry_gr.group == gr.group;
            let resource_ok = entry_gr.resource == "*" || entry_gr.resource == gr.resource;
            group_ok && resource_ok && grant.allows_verb(verb) && grant.namespace.is_none() && grant.names.is_none()
        })
    }

    /// Every namespace this user may list `gr` in by name-restricted or
    /// unrestricted `RoleBinding` grants. Empty if the user only has cluster-wide or no grant.
    pub fn namespaces(&self, verb: &str, gr: &GroupResource) -> Vec<(String, Option<Vec<String>>)> {
        let Some(entries) = self.grants.get(verb).or_else(|| self.grants.get("*")) else { return Vec::new() };
        entries
            .iter()
            .filter(|(entry_gr, grant)| {
                let group_ok = entry_gr.group == "*" || entry_gr.group == gr.group;
                let resource_ok = entry_gr.resource == "*" || entry_gr.resource == gr.resource;
                group_ok && resource_ok && grant.allows_verb(verb) && grant.namespace.is_some()
            })
            .filter_map(|(_, grant)| grant.namespace.clone().map(|ns| (ns, grant.names.clone())))
            .collect()
    }
}

/// Inputs scanned to build an [`AccessSet`]: the RBAC objects currently
/// cached by the schema controller's watches.
pub struct RbacInputs<'a> {
    pub role_bindings: &'a [RoleBinding],
    pub cluster_role_bindings: &'a [ClusterRoleBinding],
    pub roles: &'a [Role],
    pub cluster_roles: &'a [ClusterRole],
}

/// Scans `inputs` for bindings whose subjects match `user`, resolves the
/// referenced `Role`/`ClusterRole`, and builds the resulting grant set.
pub fn compute_access_set(user: &User, inputs: &RbacInputs) -> AccessSet {
    let mut grants: BTreeMap<String, Vec<(GroupResource, Grant)>> = BTreeMap::new();
    let mut fingerprint: Vec<u64> = Vec::new();

    for rb in inputs.role_bindings {
        if !subjects_match(rb.subjects.as_deref(), user) {
            continue;
        }
        let Some(ns) = rb.metadata.namespace.clone() else { continue };
        let rules = resolve_role_ref(&rb.role_ref.kind, &rb.role_ref.name, &ns, inputs);
        fingerprint.push(binding_fingerprint(&rb.metadata));
        for rule in rules {
            apply_rule(&mut grants, rule, Some(ns.clone()));
        }
    }

    for crb in inputs.cluster_role_bindings {
        if !subjects_match(crb.subjects.as_deref(), user) {
            continue;
        }
        let rules = resolve_cluster_role(&crb.role_ref.name, inputs);
        fingerprint.push(binding_fingerprint(&crb.metadata));
        for rule in rules {
            apply_rule(&mut grants, rule, None);
        }
    }

    if grants.is_empty() {
        return AccessSet::empty();
    }

    fingerprint.sort_unstable();
    let id = hash_all(&fingerprint);
    AccessSet { grants, id }
}

fn subjects_match(subjects: Option<&[Subject]>, user: &User) -> bool {
    subjects.map_or(false, |subs| subs.iter().any(|s| user.is_subject(s)))
}

fn resolve_role_ref(kind: &str, name: &str, namespace: &str, inputs: &RbacInputs) -> Vec<PolicyRule> {
    match kind {
        "Role" => inputs
            .roles
            .iter()
            .find(|r| r.metadata.name.as_deref() == Some(name) && r.metadata.namespace.as_deref() == Some(namespace))
            .and_then(|r| r.rules.clone())
            .unwrap_or_default(),
        "ClusterRole" => resolve_cluster_role(name, inputs),
        _ => Vec::new(),
    }
}

fn resolve_cluster_role(name: &str, inputs: &RbacInputs) -> Vec<PolicyRule> {
    inputs
        .cluster_roles
        .iter()
        .find(|r| r.metadata.name.as_deref() == Some(name))
        .and_then(|r| r.rules.clone())
        .unwrap_or_default()
}

fn apply_rule(grants: &mut BTreeMap<String, Vec<(GroupResource, Grant)>>, rule: PolicyRule, namespace: Option<String>) {
    if rule.non_resource_urls.is_some() {
        return; // non-resource rules (e.g. `/healthz`) are out of scope for object access
    }
    let groups = rule.api_groups.unwrap_or_else(|| vec!["*".to_string()]);
    let resources = rule.resources.unwrap_or_else(|| vec!["*".to_string()]);
    let names = rule.resource_names.filter(|n| !n.is_empty());

    for group in &groups {
        for resource in &resources {
            let gr = GroupResource::new(group.clone(), resource.clone());
            let grant = Grant { verbs: rule.verbs.clone(), namespace: namespace.clone(), names: names.clone() };
            for verb in &grant.verbs {
                grants.entry(verb.clone()).or_default().push((gr.clone(), grant.clone()));
            }
        }
    }
}

fn binding_fingerprint(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> u64 {
    let mut hasher = FxHasher::default();
    meta.name.hash(&mut hasher);
    meta.namespace.hash(&mut hasher);
    meta.resource_version.hash(&mut hasher);
    hasher.finish()
}

fn hash_all(values: &[u64]) -> u64 {
    let mut hasher = FxHasher::default();
    values.hash(&mut hasher);
    hasher.finish()
}

/// Per-user cache keyed by identity: `(AccessSet, bindingsHash)`.
pub struct AccessStore {
    cache: Mutex<HashMap<User, (Arc<AccessSet>, u64)>>,
}

impl Default for AccessStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessStore {
    pub fn new() -> Self {
        Self { cache: Mutex::new(HashMap::new()) }
    }

    /// Non-blocking after the first warm-up: a
    /// cache hit never rescans `inputs`.
    pub fn access_for(&self, user: &User, inputs: &RbacInputs) -> Arc<AccessSet> {
        let mut cache = self.cache.lock().expect("access store mutex poisoned");
        if let Some((set, _)) = cache.get(user) {
            return Arc::clone(set);
        }
        let set = Arc::new(compute_access_set(user, inputs));
        let hash = relevant_bindings_hash(user, inputs);
        cache.insert(user.clone(), (Arc::clone(&set), hash));
        set
    }

    /// Recomputes the bindings hash for every cached user against the
    /// latest `inputs`; any whose hash changed is evicted and recomputed on
    /// next `access_for`.
    pub fn on_rbac_event(&self, inputs: &RbacInputs) {
        let mut cache = self.cache.lock().expect("access store mutex poisoned");
        let mut invalidated = 0;
        cache.retain(|user, (_, hash)| {
            let fresh = relevant_bindings_hash(user, inputs);
            let keep = fresh == *hash;
            if !keep {
                invalidated += 1;
            }
            keep
        });
        if invalidated > 0 {
            debug!(invalidated, "access store invalidated entries after RBAC change");
        }
    }
}

fn relevant_bindings_hash(user: &User, inputs: &RbacInputs) -> u64 {
    let mut fingerprint: Vec<u64> = Vec::new();
    for rb in inputs.role_bindings {
        if subjects_match(rb.subjects.as_deref(), user) {
            fingerprint.push(binding_fingerprint(&rb.metadata));
        }
    }
    for crb in inputs.cluster_role_bindings {
        if subjects_match(crb.subjects.as_deref(), user) {
            fingerprint.push(binding_fingerprint(&crb.metadata));
        }
    }
    fingerprint.sort_unstable();
    hash_all(&fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn subject_user(name: &str) -> Subject {
        Subject { kind: "User".to_string(), name: name.to_string(), namespace: None, api_group: None }
    }

    fn role_binding(name: &str, ns: &str, subject: &str, role: &str, rv: &str) -> RoleBinding {
        RoleBinding {
            metadata: ObjectMeta { name: Some(name.into()), namespace: Some(ns.into()), resource_version: Some(rv.into()), ..Default::default() },
            subjects: Some(vec![subject_user(subject)]),
            role_ref: k8s_openapi::api::rbac::v1::RoleRef { api_group: "rbac.authorization.k8s.io".into(), kind: "Role".into(), name: role.into() },
        }
    }

    fn role(name: &str, ns: &str, verbs: &[&str], resources: &[&str]) -> Role {
        Role {
            metadata: ObjectMeta { name: Some(name.into()), namespace: Some(ns.into()), ..Default::default() },
            rules: Some(vec![PolicyRule {
                api_groups: Some(vec!["".into()]),
                resources: Some(resources.iter().map(|s| s.to_string()).collect()),
                resource_names: None,
                verbs: verbs.iter().map(|s| s.to_string()).collect(),
                non_resource_urls: None,
            }]),
        }
    }

    #[test]
    fn role_binding_grants_scoped_to_its_namespace() {
        let user = User::new("alice", vec![]);
        let rbs = vec![role_binding("rb", "team-a", "alice", "pod-reader", "1")];
        let roles = vec![role("pod-reader", "team-a", &["get", "list"], &["pods"])];
        let inputs = RbacInputs { role_bindings: &rbs, cluster_role_bindings: &[], roles: &roles, cluster_roles: &[] };

        let set = compute_access_set(&user, &inputs);
        let gr = GroupResource::new("", "pods");
        assert!(set.grants("list", &gr, Some("team-a"), "any-pod"));
        assert!(!set.grants("list", &gr, Some("team-b"), "any-pod"));
        assert!(!set.grants("delete", &gr, Some("team-a"), "any-pod"));
        assert!(!set.is_passthrough("list", &gr));
    }

    #[test]
    fn cluster_role_binding_grants_are_namespace_unrestricted() {
        let user = User::new("bob", vec!["cluster-admins".to_string()]);
        let crbs = vec![k8s_openapi::api::rbac::v1::ClusterRoleBinding {
            metadata: ObjectMeta { name: Some("crb".into()), resource_version: Some("5".into()), ..Default::default() },
            subjects: Some(vec![Subject { kind: "Group".to_string(), name: "cluster-admins".to_string(), namespace: None, api_group: None }]),
            role_ref: k8s_openapi::api::rbac::v1::RoleRef { api_group: "rbac.authorization.k8s.io".into(), kind: "ClusterRole".into(), name: "admin".into() },
        }];
        let croles = vec![ClusterRole {
            metadata: ObjectMeta { name: Some("admin".into()), ..Default::default() },
            rules: Some(vec![PolicyRule {
                api_groups: Some(vec!["*".into()]),
                resources: Some(vec!["*".into()]),
                resource_names: None,
                verbs: vec!["*".into()],
                non_resource_urls: None,
            }]),
            aggregation_rule: None,
        }];
        let inputs = RbacInputs { role_bindings: &[], cluster_role_bindings: &crbs, roles: &[], cluster_roles: &croles };

        let set = compute_access_set(&user, &inputs);
        let gr = GroupResource::new("", "pods");
        assert!(set.grants("list", &gr, Some("any-ns"), "anything"));
        assert!(set.is_passthrough("list", &gr));
    }

    #[test]
    fn equal_binding_sets_produce_equal_ids() {
        let user = User::new("alice", vec![]);
        let rbs = vec![role_binding("rb", "team-a", "alice", "pod-reader", "1")];
        let roles = vec![role("pod-reader", "team-a", &["get", "list"], &["pods"])];
        let inputs = RbacInputs { role_bindings: &rbs, cluster_role_bindings: &[], roles: &roles, cluster_roles: &[] };

        let a = compute_access_set(&user, &inputs);
        let b = compute_access_set(&user, &inputs);
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn access_store_invalidates_on_resource_version_change() {
        let store = AccessStore::new();
        let user = User::new("alice", vec![]);
        let mut rbs = vec![role_binding("rb", "team-a", "alice", "pod-reader", "1")];
        let roles = vec![role("pod-reader", "team-a", &["get", "list"], &["pods"])];
        let inputs = RbacInputs { role_bindings: &rbs, cluster_role_bindings: &[], roles: &roles, cluster_roles: &[] };

        let first = store.access_for(&user, &inputs);
        let first_id = first.id();

        rbs[0].metadata.resource_version = Some("2".into());
        let inputs2 = RbacInputs { role_bindings: &rbs, cluster_role_bindings: &[], roles: &roles, cluster_roles: &[] };
        store.on_rbac_event(&inputs2);

        let second = store.access_for(&user, &inputs2);
        assert_eq!(first_id, second.id(), "content is unchanged so the id is stable, but the entry must have been recomputed not reused");
    }
}
