//! Concurrent cache of [`CopyState`] snapshots keyed by the pinned commit's checkpoint.
//!
//! ```text
//!   get_or_create(cp) ──► cached under cp ─────────────────────► refs += 1
//!                     └─► build lock ──► factory() ──► commit checkpoint K
//!                                          ├─ K cached ──► refs += 1, drop new pin
//!                                          └─ K vacant ──► insert (refs = 1)
//!   lookup ─────────────► read only, refs unchanged
//!   release ────────────► refs -= 1 (checked) ──► 0 ──► remove + release commit
//! ```
//!
//! A replica may ask for a checkpoint the primary has already moved past.
//! The snapshot is then filed under the checkpoint of the commit it actually
//! pins, which is also what the replica is told, so its file request finds it.
//!
//! All reference count changes happen while holding the DashMap shard lock
//! for the key, so a release that drops the count to zero and a concurrent
//! `get_or_create` for the same checkpoint cannot interleave.

use super::checkpoint::ReplicationCheckpoint;
use super::copy_state::CopyState;
use crate::error::Result;
use crate::metrics::ReplicationMetrics;
use crate::types::ShardId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared cache of snapshots being served to replicas.
#[derive(Debug)]
pub struct CopyStateCache {
    entries: DashMap<ReplicationCheckpoint, Arc<CopyState>>,
    /// Serializes snapshot creation so concurrent misses build once.
    build: Mutex<()>,
    metrics: Arc<ReplicationMetrics>,
}

impl CopyStateCache {
    /// Create an empty cache reporting into `metrics`.
    pub fn new(metrics: Arc<ReplicationMetrics>) -> Self {
        Self {
            entries: DashMap::new(),
            build: Mutex::new(()),
            metrics,
        }
    }

    /// Return a referenced snapshot for `checkpoint`, building it with `factory` on a miss.
    ///
    /// The returned snapshot is cached under its own [`CopyState::checkpoint`],
    /// which differs from `checkpoint` when the commit has moved on. An
    /// existing entry gains a reference; a new one starts with a single
    /// reference. The factory must not call back into this cache. A factory
    /// error leaves the cache untouched.
    pub fn get_or_create<F>(&self, checkpoint: &ReplicationCheckpoint, factory: F) -> Result<Arc<CopyState>>
    where
        F: FnOnce() -> Result<CopyState>,
    {
        if let Some(state) = self.acquire_existing(checkpoint) {
            return Ok(state);
        }

        let _building = self.build.lock();
        if let Some(state) = self.acquire_existing(checkpoint) {
            return Ok(state);
        }

        let built = factory()?;
        let key = built.checkpoint().clone();
        match self.entries.entry(key.clone()) {
            Entry::Occupied(entry) => {
                let refs = entry.get().inc_ref();
                let existing = entry.get().clone();
                drop(entry);
                built.release_commit();
                self.metrics.copy_state_cache_hits.inc();
                debug!(requested = %checkpoint, checkpoint = %key, refs, "Commit already cached, reusing");
                Ok(existing)
            }
            Entry::Vacant(entry) => {
                let state = Arc::new(built);
                entry.insert(state.clone());
                self.metrics.copy_states_created.inc();
                self.metrics.cached_copy_states.inc();
                debug!(requested = %checkpoint, checkpoint = %key, files = state.files().len(), "Cached new copy state");
                Ok(state)
            }
        }
    }

    /// Take a reference on an existing entry. The read guard keeps a
    /// concurrent last release from removing it in between.
    fn acquire_existing(&self, checkpoint: &ReplicationCheckpoint) -> Option<Arc<CopyState>> {
        let entry = self.entries.get(checkpoint)?;
        let refs = entry.value().inc_ref();
        self.metrics.copy_state_cache_hits.inc();
        debug!(%checkpoint, refs, "Reusing cached copy state");
        Some(entry.value().clone())
    }

    /// The cached snapshot for `checkpoint`, without creating or referencing it.
    pub fn lookup(&self, checkpoint: &ReplicationCheckpoint) -> Option<Arc<CopyState>> {
        self.entries.get(checkpoint).map(|e| e.value().clone())
    }

    /// Give up one reference to `checkpoint`.
    ///
    /// The last release removes the entry and lets go of the commit. A release
    /// with no reference left to give up is logged and ignored; returns
    /// whether a reference was actually released.
    pub fn release(&self, checkpoint: &ReplicationCheckpoint) -> bool {
        let removed = match self.entries.entry(checkpoint.clone()) {
            Entry::Occupied(entry) => match entry.get().dec_ref() {
                Some(0) => {
                    let (_, state) = entry.remove_entry();
                    Some(state)
                }
                Some(refs) => {
                    debug!(%checkpoint, refs, "Released copy state reference");
                    return true;
                }
                None => {
                    warn!(%checkpoint, "Release of copy state with no outstanding references");
                    return false;
                }
            },
            Entry::Vacant(_) => {
                warn!(%checkpoint, "Release of copy state that is not cached");
                return false;
            }
        };

        // The map lock is dropped; the hold callback may take engine locks.
        if let Some(state) = removed {
            state.release_commit();
            self.metrics.cached_copy_states.dec();
            debug!(%checkpoint, "Removed copy state after last release");
        }
        true
    }

    /// Drop every snapshot of a shard that is closing and release their commits.
    ///
    /// Transfers still holding one of these snapshots keep their `Arc`, but
    /// their later release finds nothing and returns `false`.
    pub fn invalidate_shard(&self, shard_id: &ShardId) -> usize {
        let keys: Vec<_> = self
            .entries
            .iter()
            .filter(|e| &e.key().shard_id == shard_id)
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for key in keys {
            if let Some((_, state)) = self.entries.remove(&key) {
                state.clear_refs();
                state.release_commit();
                self.metrics.cached_copy_states.dec();
                removed += 1;
            }
        }
        if removed > 0 {
            info!(%shard_id, removed, "Invalidated cached copy states");
        }
        removed
    }

    /// Whether `checkpoint` is cached.
    pub fn contains(&self, checkpoint: &ReplicationCheckpoint) -> bool {
        self.entries.contains_key(checkpoint)
    }

    /// Live references to `checkpoint`, zero when not cached.
    pub fn ref_count(&self, checkpoint: &ReplicationCheckpoint) -> usize {
        self.entries
            .get(checkpoint)
            .map(|e| e.value().ref_count())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for CopyStateCache {
    fn default() -> Self {
        Self::new(Arc::new(ReplicationMetrics::new()))
    }
}
