//! Resolves a [`Gvk`] to the `kube` `ApiResource`/scope needed to build a
//! dynamic `Api` handle.

use kube::core::ApiResource;
use kube::discovery::{Discovery, Scope};
use kube::Client;
use steve_core::Gvk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("gvk not found in discovery: {0}")]
    NotFound(Gvk),
    #[error("discovery failed: {0}")]
    Kube(#[from] kube::Error),
}

/// `(api_resource, namespaced)` for `gvk`, resolved via a fresh discovery run.
/// The schema controller (component I) is the authoritative, long-lived
/// holder of this mapping; the informer re-resolves once at startup because
/// it has no standing subscription to discovery changes of its own.
pub async fn find_api_resource(client: Client, gvk: &Gvk) -> Result<(ApiResource, bool), DiscoveryError> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(DiscoveryError::NotFound(gvk.clone()))
}
