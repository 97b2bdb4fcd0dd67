//! Keel store: the ownership cache, an in-RAM mirror of the resources this installer
//! created, scoped by owner labels.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use keel_core::{ClusterClient, Labels, ObjectId, Resource, ResourceKey, ResourceSet, Result};
use metrics::{counter, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info};

/// Map keyed by object identity with stable insertion order. Overwriting an entry
/// keeps its position, whichever served version the new copy carries.
#[derive(Default)]
struct Entries {
    map: FxHashMap<ObjectId, Resource>,
    order: VecDeque<ObjectId>,
}

impl Entries {
    fn set(&mut self, res: Resource) {
        let id = res.key().object_id();
        if !self.map.contains_key(&id) {
            self.order.push_back(id.clone());
        }
        self.map.insert(id, res);
    }

    fn remove(&mut self, id: &ObjectId) -> bool {
        if self.map.remove(id).is_some() {
            self.order.retain(|k| k != id);
            true
        } else {
            false
        }
    }

    fn list(&self) -> ResourceSet {
        self.order.iter().filter_map(|k| self.map.get(k).cloned()).collect()
    }
}

/// Process-lifetime cache of owned resources.
///
/// Writes are internally synchronised so parallel branches of one reconcile may
/// insert and delete concurrently. The lock is never held across an await.
#[derive(Default)]
pub struct OwnershipCache {
    entries: Mutex<Entries>,
}

impl OwnershipCache {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> std::sync::MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Snapshot of every cached resource in insertion order.
    pub fn list(&self) -> ResourceSet { self.lock().list() }

    pub fn len(&self) -> usize { self.lock().map.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Lookup by object identity; the entry may carry another served version than `key`.
    pub fn get(&self, key: &ResourceKey) -> Option<Resource> { self.lock().map.get(&key.object_id()).cloned() }

    /// Insert, or overwrite the entry for the same object.
    pub fn set(&self, res: Resource) {
        debug!(key = %res.key(), "cache set");
        self.lock().set(res);
    }

    /// Remove the entry for the same object; absent ones are ignored.
    pub fn delete(&self, res: &Resource) {
        let key = res.key();
        if self.lock().remove(&key.object_id()) {
            debug!(key = %key, "cache delete");
        }
    }

    /// Refresh the entries owned by `labels` from the live cluster. Listed objects
    /// accepted by `owned` are inserted or overwritten; cached ones with no live
    /// counterpart at all are dropped. Identity here ignores the API version, so an
    /// entry cached under one served version is kept when the listing reports another.
    pub async fn sync<F>(&self, client: &dyn ClusterClient, labels: &Labels, owned: F) -> Result<usize>
    where
        F: Fn(&Resource) -> bool,
    {
        let started = Instant::now();
        let listed = client.list(labels).await?;
        let live_ids: FxHashSet<ObjectId> = listed.iter().map(|r| r.key().object_id()).collect();
        let live: Vec<Resource> = listed.into_iter().filter(|r| owned(r)).collect();
        let dropped = {
            let mut entries = self.lock();
            let stale: Vec<ObjectId> = entries
                .order
                .iter()
                .filter(|id| !live_ids.contains(*id))
                .filter(|id| entries.map.get(*id).map(|r| r.has_labels(labels)).unwrap_or(false))
                .cloned()
                .collect();
            for id in &stale {
                entries.remove(id);
            }
            for res in live.iter().cloned() {
                let cached_version = entries.map.get(&res.key().object_id()).map(|r| r.gvk().version);
                match cached_version {
                    Some(v) if v != res.gvk().version => {}
                    _ => entries.set(res),
                }
            }
            stale.len()
        };
        histogram!("keel_cache_sync_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("keel_cache_sync_total", 1u64);
        info!(live = live.len(), dropped, labels = ?labels, "ownership cache synced");
        Ok(live.len())
    }
}
