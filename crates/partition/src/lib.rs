//! Turns `(user, gvk)` into the `[]Partition` a list request is serviced
//! from.
//!
//! Grounded on `steve_core::Partition`'s own doc comment, which already
//! anticipated this split: "turns a partition set into a `WHERE` clause" is
//! component C's half; this module is the other half, deciding what that
//! set *is* from an `AccessSet`.

#![forbid(unsafe_code)]

use steve_access::{AccessSet, GroupResource};
use steve_core::Partition;

/// Resolves `projectsornamespaces` project labels to concrete namespace
/// names — an inner list against the `namespaces` GVK cache the caller
/// already holds a handle to. Kept as a trait so this crate never needs a
/// dependency on the cache factory or query planner.
pub trait ProjectResolver {
    /// Namespaces whose `field.cattle.io/projectId`-equivalent label equals
    /// `project`. Empty if the project has no member namespaces (or doesn't
    /// exist).
    fn namespaces_in_project(&self, project: &str) -> Vec<String>;
}

/// A resolver that treats every `projectsornamespaces` entry as a literal
/// namespace name — used when the caller has no project/namespace
/// hierarchy to expand (tests, or deployments without the concept).
pub struct NoProjects;

impl ProjectResolver for NoProjects {
    fn namespaces_in_project(&self, _project: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Computes the partitions `user` may read `gvk` (identified by its plural
/// `gr`) through, optionally narrowed by a `projectsornamespaces` URL
/// parameter.
///
/// `namespaced` comes from the GVK's schema:
/// cluster-scoped resources always resolve to `[Passthrough]` or `[]`,
/// never to a namespace-scoped partition.
pub fn partitions_for(
    access: &AccessSet,
    gr: &GroupResource,
    namespaced: bool,
    projects_or_namespaces: Option<&[String]>,
    negate: bool,
    resolver: &dyn ProjectResolver,
) -> Vec<Partition> {
    if !namespaced {
        return if access.is_passthrough("list", gr) { vec![Partition::Passthrough] } else { Vec::new() };
    }

    if access.is_passthrough("list", gr) {
        return match projects_or_namespaces {
            None => vec![Partition::Passthrough],
            Some(scopes) => {
                let wanted = expand_scopes(scopes, resolver);
                if negate {
                    // Passthrough minus an explicit exclusion set still has
                    // to be expressed as a `Partition`, but this layer has
                    // no "every namespace except N" variant; the query
                    // planner handles negation directly on the parameter,
                    // so passthrough stays.
                    vec![Partition::Passthrough]
                } else {
                    wanted.into_iter().map(|ns| Partition::Scoped { namespace: ns, names: None }).collect()
                }
            }
        };
    }

    let granted = access.namespaces("list", gr);
    let allowed: Vec<(String, Option<Vec<String>>)> = match projects_or_namespaces {
        None => granted,
        Some(scopes) => {
            let wanted = expand_scopes(scopes, resolver);
            granted
                .into_iter()
                .filter(|(ns, _)| {
                    let in_set = wanted.contains(ns);
                    if negate { !in_set } else { in_set }
                })
                .collect()
        }
    };

    allowed.into_iter().map(|(namespace, names)| Partition::Scoped { namespace, names }).collect()
}

fn expand_scopes(scopes: &[String], resolver: &dyn ProjectResolver) -> Vec<String> {
    let mut out = Vec::new();
    for scope in scopes {
        let project_namespaces = resolver.namespaces_in_project(scope);
        if project_namespaces.is_empty() {
            out.push(scope.clone());
        } else {
            out.extend(project_namespaces);
        }
    }
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use steve_access::{compute_access_set, RbacInputs, User};

    fn gr() -> GroupResource {
        GroupResource::new("", "pods")
    }

    #[test]
    fn cluster_scoped_resource_with_no_grant_has_no_partitions() {
        let user = User::new("nobody", vec![]);
        let inputs = RbacInputs { role_bindings: &[], cluster_role_bindings: &[], roles: &[], cluster_roles: &[] };
        let access = compute_access_set(&user, &inputs);
        let parts = partitions_for(&access, &gr(), false, None, false, &NoProjects);
        assert!(parts.is_empty());
    }

    #[test]
    fn passthrough_without_scope_param_is_one_partition() {
        let user = User::new("admin", vec!["cluster-admins".to_string()]);
        let crbs = vec![k8s_openapi::api::rbac::v1::ClusterRoleBinding {
            metadata: Default::default(),
            subjects: Some(vec![k8s_openapi::api::rbac::v1::Subject {
                kind: "Group".into(),
                name: "cluster-admins".into(),
                namespace: None,
                api_group: None,
            }]),
            role_ref: k8s_openapi::api::rbac::v1::RoleRef { api_group: "rbac.authorization.k8s.io".into(), kind: "ClusterRole".into(), name: "admin".into() },
        }];
        let croles = vec![k8s_openapi::api::rbac::v1::ClusterRole {
            metadata: Default::default(),
            rules: Some(vec![k8s_openapi::api::rbac::v1::PolicyRule {
                api_groups: Some(vec!["*".into()]),
                resources: Some(vec!["*".into()]),
                resource_names: None,
                verbs: vec!["*".into()],
                non_resource_urls: None,
            }]),
            aggregation_rule: None,
        }];
        let inputs = RbacInputs { role_bindings: &[], cluster_role_bindings: &crbs, roles: &[], cluster_roles: &croles };
        let access = compute_access_set(&user, &inputs);

        let parts = partitions_for(&access, &gr(), true, None, false, &NoProjects);
        assert_eq!(parts, vec![Partition::Passthrough]);
    }

    #[test]
    fn namespace_scoped_grant_becomes_one_scoped_partition() {
        let user = User::new("alice", vec![]);
        let rbs = vec![k8s_openapi::api::rbac::v1::RoleBinding {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta { namespace: Some("team-a".into()), name: Some("rb".into()), ..Default::default() },
            subjects: Some(vec![k8s_openapi::api::rbac::v1::Subject { kind: "User".into(), name: "alice".into(), namespace: None, api_group: None }]),
            role_ref: k8s_openapi::api::rbac::v1::RoleRef { api_group: "rbac.authorization.k8s.io".into(), kind: "Role".into(), name: "pod-reader".into() },
        }];
        let roles = vec![k8s_openapi::api::rbac::v1::Role {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta { namespace: Some("team-a".into()), name: Some("pod-reader".into()), ..Default::default() },
            rules: Some(vec![k8s_openapi::api::rbac::v1::PolicyRule {
                api_groups: Some(vec!["".into()]),
                resources: Some(vec!["pods".into()]),
                resource_names: None,
                verbs: vec!["list".into()],
                non_resource_urls: None,
            }]),
        }];
        let inputs = RbacInputs { role_bindings: &rbs, cluster_role_bindings: &[], roles: &roles, cluster_roles: &[] };
        let access = compute_access_set(&user, &inputs);

        let parts = partitions_for(&access, &gr(), true, None, false, &NoProjects);
        assert_eq!(parts, vec![Partition::Scoped { namespace: "team-a".into(), names: None }]);

        let narrowed = partitions_for(&access, &gr(), true, Some(&["team-b".to_string()]), false, &NoProjects);
        assert!(narrowed.is_empty());
    }
}
