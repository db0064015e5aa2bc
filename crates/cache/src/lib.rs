//! Lazy per-GVK informer creation and lifecycle.
//!
//! The factory holds one informer per GVK, created on first use and torn
//! down independently, under a fixed locking order: the factory map lock
//! only ever guards the map, never creation work; a per-GVK `informer_lock`
//! guards lazy creation; a per-GVK read-preferring `stop_lock` gates
//! `Stop(gvk)` against callers still holding a live handle.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use steve_core::Gvk;
use steve_indexer::{GvkConfig, Indexer};
use steve_informer::{InformerHandle, Transform};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, RwLock};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("timed out waiting for {0} to finish its initial sync")]
    SyncTimeout(Gvk),
    #[error("informer creation failed for {0}: {1}")]
    Spawn(Gvk, String),
}

/// Per-GVK encryption policy: Secret-like
/// kinds are always encrypted; everything else is encrypted only when the
/// env-var escape hatch is set.
pub fn should_encrypt(gvk: &Gvk, encrypt_all: bool) -> bool {
    if encrypt_all {
        return true;
    }
    const ALWAYS_ENCRYPTED: &[(&str, &str)] = &[("", "Secret"), ("cattle.io", "Token")];
    ALWAYS_ENCRYPTED.iter().any(|(group, kind)| gvk.group == *group && gvk.kind == *kind)
}

/// How to build the informer for a GVK the factory hasn't seen yet: which
/// fields to index, whether to encrypt, what transform to run, and an
/// optional field selector for the initial LIST/WATCH.
pub struct GvkSpec {
    pub indexed_fields: Vec<(String, steve_core::FieldPath)>,
    pub encrypt: bool,
    pub transform: Arc<dyn Transform>,
    pub field_selector: Option<String>,
    pub ring_capacity: usize,
}

struct GuardedInformer {
    /// Guards lazy creation of `informer`; held only while spawning.
    informer_lock: Mutex<Option<Arc<InformerHandle>>>,
    /// Read-preferring gate: `CacheFor` holds a read guard for the lifetime
    /// of the caller's handle; `Stop` takes the write side and therefore
    /// waits for every live reader to release first.
    stop_lock: Arc<RwLock<()>>,
}

/// A caller's live handle on a GVK's cache. Holding this keeps `Stop(gvk)`
/// from proceeding past waiting for all such handles to drop.
pub struct CacheHandle {
    pub gvk: Gvk,
    pub informer: Arc<InformerHandle>,
    _read_guard: OwnedRwLockReadGuard<()>,
}

/// Owns one [`GuardedInformer`] per GVK plus the indexer and kube client
/// they all share.
pub struct CacheFactory {
    client: Client,
    indexer: Arc<Indexer>,
    informers: Mutex<HashMap<Gvk, Arc<GuardedInformer>>>,
    sync_timeout: Duration,
}

impl CacheFactory {
    pub fn new(client: Client, indexer: Arc<Indexer>, sync_timeout: Duration) -> Self {
        Self { client, indexer, informers: Mutex::new(HashMap::new()), sync_timeout }
    }

    /// Returns the entry for `gvk`, creating it (map slot only, not the
    /// informer itself) if absent. The map lock is dropped before any
    /// creation work happens.
    async fn entry(&self, gvk: &Gvk) -> Arc<GuardedInformer> {
        let mut map = self.informers.lock().await;
        map.entry(gvk.clone())
            .or_insert_with(|| Arc::new(GuardedInformer { informer_lock: Mutex::new(None), stop_lock: Arc::new(RwLock::new(())) }))
            .clone()
    }

    /// Spins up the informer for `gvk` on first use (blocking until its
    /// first relist is applied, bounded by the factory's `sync_timeout`),
    /// or returns the existing one. Returns a [`CacheHandle`] that must be
    /// held for as long as the caller queries the cache — dropping it frees
    /// the factory's `stop_lock` read side for a pending `Stop(gvk)`.
    pub async fn cache_for(&self, gvk: &Gvk, spec: &GvkSpec) -> Result<CacheHandle, CacheError> {
        let guarded = self.entry(gvk).await;

        // Read lock first: if a `Stop` is mid-flight (holding the write
        // side), new callers queue behind it rather than racing a teardown.
        let read_guard = Arc::clone(&guarded.stop_lock).read_owned().await;

        let mut slot = guarded.informer_lock.lock().await;
        if slot.is_none() {
            self.indexer
                .register(
                    gvk.clone(),
                    GvkConfig { ring_capacity: spec.ring_capacity, indexed_fields: spec.indexed_fields.clone(), encrypt: spec.encrypt },
                )
                .map_err(|e| CacheError::Spawn(gvk.clone(), e.to_string()))?;
            let handle = steve_informer::spawn_for_gvk(
                self.client.clone(),
                gvk.clone(),
                spec.field_selector.clone(),
                Arc::clone(&self.indexer),
                Arc::clone(&spec.transform),
            )
            .await
            .map_err(|e| CacheError::Spawn(gvk.clone(), e.to_string()))?;
            info!(gvk = %gvk, "cache factory created informer");
            *slot = Some(Arc::new(handle));
        }
        let informer = Arc::clone(slot.as_ref().expect("just set"));
        drop(slot);

        if !informer.wait_synced(self.sync_timeout).await {
            // Cancellation of the caller's wait never tears down the
            // informer: it keeps running in the background for
            // the next caller.
            return Err(CacheError::SyncTimeout(gvk.clone()));
        }

        Ok(CacheHandle { gvk: gvk.clone(), informer, _read_guard: read_guard })
    }

    /// Cancels `gvk`'s informer, waits for every live [`CacheHandle`] to
    /// drop, joins the informer task, and drops all its tables — or is a
    /// no-op if no informer was ever created.
    pub async fn stop(&self, gvk: &Gvk) {
        let guarded = {
            let mut map = self.informers.lock().await;
            map.remove(gvk)
        };
        let Some(guarded) = guarded else { return };

        let slot = guarded.informer_lock.lock().await;
        let Some(informer) = slot.clone() else { return };
        informer.stop();
        drop(slot);

        // Blocks until every outstanding `CacheHandle` for this GVK has been
        // dropped: the read-preferring lock gates `Stop` against live readers.
        let _write_guard = guarded.stop_lock.write().await;

        if let Err(e) = tokio::time::timeout(Duration::from_secs(30), wait_join(&informer)).await {
            warn!(gvk = %gvk, error = ?e, "informer task did not join within timeout; dropping tables anyway");
        }

        if let Err(e) = self.indexer.drop_all(gvk) {
            warn!(gvk = %gvk, error = %e, "drop_all failed during Stop");
        }
        info!(gvk = %gvk, "cache factory stopped and dropped all state");
    }

    pub fn indexer(&self) -> Arc<Indexer> {
        Arc::clone(&self.indexer)
    }
}

async fn wait_join(informer: &Arc<InformerHandle>) {
    // `JoinHandle` isn't directly awaitable through a shared reference;
    // since `stop()` already cancelled the token, the task will observe it
    // and return on its own. We poll the synced-channel's closed state as a
    // cheap proxy for "has the task torn down its sender", bounded by the
    // caller's outer timeout.
    let mut rx = informer.synced.clone();
    loop {
        if rx.changed().await.is_err() {
            return; // sender dropped: the task has exited
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steve_core::Gvk;

    #[test]
    fn secret_and_cattle_token_are_always_encrypted() {
        assert!(should_encrypt(&Gvk::new("", "v1", "Secret"), false));
        assert!(should_encrypt(&Gvk::new("cattle.io", "v1", "Token"), false));
        assert!(!should_encrypt(&Gvk::new("", "v1", "Pod"), false));
    }

    #[test]
    fn encrypt_all_override_applies_to_every_gvk() {
        assert!(should_encrypt(&Gvk::new("", "v1", "Pod"), true));
    }
}
