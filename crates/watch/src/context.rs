//! The seam between this crate and the rest of the workspace.
//!
//! Grounded on `steve_partition::ProjectResolver` (`crates/partition/src/
//! lib.rs`): rather than depending on however the binary wires up discovery,
//! RBAC watching, and the cache factory's `GvkSpec` construction, this crate
//! asks for a small trait implementation. The demonstration binary
//! (`steve-cli`) and any future HTTP-router integration both implement it
//! the same way.

use std::sync::Arc;

use async_trait::async_trait;
use steve_access::{AccessSet, GroupResource, User};
use steve_cache::{CacheError, CacheFactory, CacheHandle};
use steve_core::Gvk;
use steve_indexer::Indexer;
use steve_schema::SchemaController;

/// What a client's `resourceType` (a schema id, e.g. `"pods"` or
/// `"cert-manager.io.certificates"`) resolves to.
#[derive(Debug, Clone)]
pub struct ResolvedType {
    pub gvk: Gvk,
    pub group_resource: GroupResource,
}

/// Everything a running subscription needs from the rest of the cache:
/// schema resolution, cache access, the shared indexer (for its ring), the
/// user's access set, and the schema controller (for indexing-change
/// detection). Implemented once per deployment by whatever owns the
/// `CacheFactory`/`SchemaController`/`AccessStore` triad.
#[async_trait]
pub trait WatchContext: Send + Sync {
    fn resolve(&self, resource_type: &str) -> Option<ResolvedType>;
    async fn cache_for(&self, gvk: &Gvk) -> Result<CacheHandle, CacheError>;
    fn indexer(&self) -> Arc<Indexer>;
    fn access_for(&self, user: &User) -> Arc<AccessSet>;
    fn schema_controller(&self) -> Arc<SchemaController>;
}

/// A straightforward [`WatchContext`] backed directly by the component
/// instances a single-process deployment (the demonstration binary) owns.
/// `resolve` and the per-GVK cache spec are supplied by the caller because
/// they depend on the schema catalog's printer columns which this crate has no
/// business re-deriving.
pub struct SimpleContext<F>
where
    F: Fn(&str) -> Option<(ResolvedType, steve_cache::GvkSpec)> + Send + Sync,
{
    pub cache: Arc<CacheFactory>,
    pub schema: Arc<SchemaController>,
    pub resolver: F,
}

#[async_trait]
impl<F> WatchContext for SimpleContext<F>
where
    F: Fn(&str) -> Option<(ResolvedType, steve_cache::GvkSpec)> + Send + Sync,
{
    fn resolve(&self, resource_type: &str) -> Option<ResolvedType> {
        (self.resolver)(resource_type).map(|(resolved, _)| resolved)
    }

    async fn cache_for(&self, gvk: &Gvk) -> Result<CacheHandle, CacheError> {
        // Re-resolve to get the `GvkSpec`; the schema catalog is cheap to
        // consult again and this keeps `WatchContext` from needing a second
        // by-GVK lookup method.
        let resource_type = gvk.to_string();
        let (_, spec) = (self.resolver)(&resource_type).ok_or_else(|| CacheError::Spawn(gvk.clone(), "schema gone".to_string()))?;
        self.cache.cache_for(gvk, &spec).await
    }

    fn indexer(&self) -> Arc<Indexer> {
        self.cache.indexer()
    }

    fn access_for(&self, user: &User) -> Arc<AccessSet> {
        // Single-tenant demonstration: no RBAC inputs to scan, so callers
        // that need real RBAC gating should supply their own `WatchContext`
        // wired to a `steve_access::AccessStore` plus a live `RbacInputs`
        // source instead of this convenience type.
        let _ = user;
        Arc::new(steve_access::compute_access_set(
            user,
            &steve_access::RbacInputs { role_bindings: &[], cluster_role_bindings: &[], roles: &[], cluster_roles: &[] },
        ))
    }

    fn schema_controller(&self) -> Arc<SchemaController> {
        Arc::clone(&self.schema)
    }
}
