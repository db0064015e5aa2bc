//! Drives list+watch against the upstream dynamic client for one GVK,
//! applies an optional transform, and writes into the indexer.
//!
//! Built on `kube::runtime::watcher`'s `Event::Applied/Deleted/Restarted`
//! shape, targeting `steve-indexer`'s `Upsert`/`Delete`/`ReplaceAll` instead
//! of a channel of raw deltas, with a transform stage plus a
//! `MethodNotSupported` terminal case for kinds that don't support watch at
//! all.

#![forbid(unsafe_code)]

mod discovery;
mod transform;

pub use discovery::{find_api_resource, DiscoveryError};
pub use transform::{DeriveStateName, Identity, Transform};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::core::ApiResource;
use kube::runtime::watcher::{self, Event};
use kube::Client;
use metrics::counter;
use serde_json::Value as Json;
use steve_core::Gvk;
use steve_indexer::Indexer;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum InformerError {
    #[error("discovery: {0}")]
    Discovery(#[from] DiscoveryError),
}

/// A running informer. Dropping this does not stop the task; call
/// [`InformerHandle::stop`] (or let the cache factory's `Stop(gvk)` cancel
/// the shared token) to tear it down.
pub struct InformerHandle {
    pub cancel: CancellationToken,
    pub synced: watch::Receiver<bool>,
    pub join: tokio::task::JoinHandle<()>,
}

impl InformerHandle {
    /// Blocks (bounded by `timeout`) until the first relist has been fully
    /// applied. Mirrors `CacheFactory::CacheFor`'s
    /// wait, but lives here so `steve-cache` doesn't need to know the ring
    /// mechanics used to report readiness.
    pub async fn wait_synced(&self, timeout: Duration) -> bool {
        let mut rx = self.synced.clone();
        if *rx.borrow() {
            return true;
        }
        tokio::time::timeout(timeout, async {
            loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_ok()
            && *rx.borrow()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Resolves `gvk` via discovery, then spawns its list+watch loop. The
/// convenience entry point `steve-cache` uses from `CacheFor` — discovery
/// lookup and spawn are split out as [`find_api_resource`]/[`spawn`] for
/// callers (tests, the schema controller) that already know the resolved
/// `ApiResource`.
pub async fn spawn_for_gvk(
    client: Client,
    gvk: Gvk,
    field_selector: Option<String>,
    indexer: Arc<Indexer>,
    transform: Arc<dyn Transform>,
) -> Result<InformerHandle, InformerError> {
    let (api_resource, namespaced) = find_api_resource(client.clone(), &gvk).await?;
    Ok(spawn(client, gvk, api_resource, namespaced, field_selector, indexer, transform))
}

/// Spawns the list+watch loop for `gvk` against `api_resource`/`namespaced`,
/// writing into `indexer` (already `register`ed for this GVK by the cache
/// factory). `transform` runs on every object before it reaches the indexer.
pub fn spawn(
    client: Client,
    gvk: Gvk,
    api_resource: ApiResource,
    namespaced: bool,
    field_selector: Option<String>,
    indexer: Arc<Indexer>,
    transform: Arc<dyn Transform>,
) -> InformerHandle {
    let cancel = CancellationToken::new();
    let (synced_tx, synced_rx) = watch::channel(false);

    let task_cancel = cancel.clone();
    let join = tokio::spawn(async move {
        run(client, gvk, api_resource, namespaced, field_selector, indexer, transform, synced_tx, task_cancel).await;
    });

    InformerHandle { cancel, synced: synced_rx, join }
}

async fn run(
    client: Client,
    gvk: Gvk,
    api_resource: ApiResource,
    namespaced: bool,
    field_selector: Option<String>,
    indexer: Arc<Indexer>,
    transform: Arc<dyn Transform>,
    synced_tx: watch::Sender<bool>,
    cancel: CancellationToken,
) {
    // The informer always caches the full collection cluster-wide — even
    // for namespaced kinds — because partitioning to what one user may read
    // happens at query time, not at ingestion time; `Api::all`
    // is the namespaced-or-not-agnostic handle `kube` gives us for that.
    let _ = namespaced;
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &api_resource);

    let mut cfg = watcher::Config::default();
    if let Some(fs) = &field_selector {
        cfg = cfg.fields(fs);
    }

    let mut backoff = Duration::from_millis(250);
    const MAX_BACKOFF: Duration = Duration::from_secs(30);

    'restart: loop {
        if cancel.is_cancelled() {
            return;
        }
        let stream = watcher::watcher(api.clone(), cfg.clone());
        futures::pin_mut!(stream);
        info!(gvk = %gvk, "informer (re)starting list+watch");

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                item = stream.next() => item,
            };
            let Some(event) = next else {
                warn!(gvk = %gvk, "watch stream ended; restarting");
                break; // falls through to 'restart with backoff
            };

            match event {
                Ok(Event::Restarted(list)) => {
                    let mut objects = HashMap::with_capacity(list.len());
                    let mut rv = String::new();
                    for obj in list {
                        if let Some(r) = obj.metadata.resource_version.clone() {
                            rv = r;
                        }
                        if let Some((key, mut json)) = to_json(&obj) {
                            transform.apply(&mut json);
                            objects.insert(key, json);
                        }
                    }
                    let count = objects.len();
                    if let Err(e) = indexer.replace_all(&gvk, &objects, &rv) {
                        warn!(gvk = %gvk, error = %e, "replace_all failed; will retry on next restart");
                    } else {
                        debug!(gvk = %gvk, count, "relist applied");
                        let _ = synced_tx.send(true);
                        backoff = Duration::from_millis(250);
                        counter!("steve_informer_relist_total", 1u64);
                    }
                }
                Ok(Event::Applied(obj)) => {
                    if let Some((key, mut json)) = to_json(&obj) {
                        transform.apply(&mut json);
                        if let Err(e) = indexer.upsert(&gvk, &key, &json) {
                            warn!(gvk = %gvk, key, error = %e, "upsert failed");
                        } else {
                            counter!("steve_informer_events_total", 1u64, "kind" => "applied");
                        }
                    }
                }
                Ok(Event::Deleted(obj)) => {
                    if let Some((key, _)) = to_json(&obj) {
                        match indexer.delete(&gvk, &key) {
                            Ok(_) => counter!("steve_informer_events_total", 1u64, "kind" => "deleted"),
                            Err(e) => warn!(gvk = %gvk, key, error = %e, "delete failed"),
                        }
                    }
                }
                Err(err) => {
                    if is_method_not_supported(&err) {
                        info!(gvk = %gvk, "kind does not support watch; informer stopping (list-only)");
                        return;
                    }
                    warn!(gvk = %gvk, error = %err, backoff = ?backoff, "watch error; restarting after backoff");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    break;
                }
            }
        }
        continue 'restart;
    }
}

/// `(objects.key, CachedObject json)` for a `DynamicObject`, or `None` if it
/// has no name (malformed upstream data, never written to the cache).
fn to_json(obj: &DynamicObject) -> Option<(String, Json)> {
    let name = obj.metadata.name.clone()?;
    let key = match &obj.metadata.namespace {
        Some(ns) => format!("{ns}/{name}"),
        None => name,
    };
    let json = serde_json::to_value(obj).ok()?;
    Some((key, json))
}

/// Walks the error's source chain looking for a `kube::Error::Api` with
/// HTTP 405 — the upstream's signal that the kind is list-only.
fn is_method_not_supported(err: &watcher::Error) -> bool {
    let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cause {
        if let Some(kube::Error::Api(resp)) = e.downcast_ref::<kube::Error>() {
            if resp.code == 405 {
                return true;
            }
        }
        cause = e.source();
    }
    false
}
