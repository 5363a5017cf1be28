//! Reference-counted snapshot of one commit's segment files.

use super::checkpoint::{FileMetadata, ReplicationCheckpoint};
use crate::error::{ReplicationError, Result};
use crate::shard::{CommitHold, IndexCommitRef, IndexShard};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Everything a replica needs to copy one commit from the primary.
///
/// The snapshot pins the commit through a [`CommitHold`] until the last
/// reference is released through the owning cache.
#[derive(Debug)]
pub struct CopyState {
    requested_checkpoint: ReplicationCheckpoint,
    checkpoint: ReplicationCheckpoint,
    files: Vec<FileMetadata>,
    manifest: Bytes,
    ref_count: AtomicUsize,
    hold: Mutex<Option<CommitHold>>,
}

impl CopyState {
    /// Build a snapshot for `requested` from the shard's latest commit.
    pub fn from_shard(requested: ReplicationCheckpoint, shard: &dyn IndexShard) -> Result<Self> {
        let commit = shard.acquire_last_index_commit()?;
        Ok(Self::from_commit(requested, commit))
    }

    /// Wrap an already pinned commit.
    pub fn from_commit(requested: ReplicationCheckpoint, commit: IndexCommitRef) -> Self {
        let IndexCommitRef {
            checkpoint,
            files,
            segment_infos,
            hold,
        } = commit;
        debug!(
            requested = %requested,
            checkpoint = %checkpoint,
            files = files.len(),
            "Created copy state"
        );
        Self {
            requested_checkpoint: requested,
            checkpoint,
            files,
            manifest: segment_infos,
            ref_count: AtomicUsize::new(1),
            hold: Mutex::new(Some(hold)),
        }
    }

    /// Checkpoint the first replica asked for. May trail [`checkpoint`](Self::checkpoint).
    pub fn requested_checkpoint(&self) -> &ReplicationCheckpoint {
        &self.requested_checkpoint
    }

    /// Checkpoint of the commit actually pinned; the cache key.
    pub fn checkpoint(&self) -> &ReplicationCheckpoint {
        &self.checkpoint
    }

    /// Files of the commit in engine order.
    pub fn files(&self) -> &[FileMetadata] {
        &self.files
    }

    /// Serialized segment infos.
    pub fn manifest(&self) -> &Bytes {
        &self.manifest
    }

    pub fn file(&self, name: &str) -> Option<&FileMetadata> {
        self.files.iter().find(|f| f.name == name)
    }

    /// Sum of all file lengths.
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    /// The files a replica asked for, in snapshot order.
    ///
    /// An empty request selects every file. Naming a file the snapshot does
    /// not contain is an error.
    pub fn files_for(&self, requested: &[String]) -> Result<Vec<FileMetadata>> {
        if requested.is_empty() {
            return Ok(self.files.clone());
        }

        let wanted: HashSet<&str> = requested.iter().map(String::as_str).collect();
        if let Some(missing) = wanted.iter().find(|name| self.file(name).is_none()) {
            return Err(ReplicationError::FileNotInSnapshot {
                file: missing.to_string(),
                checkpoint: self.checkpoint.to_string(),
            }
            .into());
        }

        Ok(self
            .files
            .iter()
            .filter(|f| wanted.contains(f.name.as_str()))
            .cloned()
            .collect())
    }

    /// Live references.
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Whether the commit is still pinned.
    pub fn is_held(&self) -> bool {
        self.hold.lock().is_some()
    }

    pub(crate) fn inc_ref(&self) -> usize {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Checked decrement. `None` when the count was already zero.
    pub(crate) fn dec_ref(&self) -> Option<usize> {
        self.ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok()
            .map(|prev| prev - 1)
    }

    /// Drop every reference at once, used when the shard goes away.
    pub(crate) fn clear_refs(&self) {
        self.ref_count.store(0, Ordering::Release);
    }

    /// Let go of the commit. Later calls are no-ops.
    pub(crate) fn release_commit(&self) {
        let hold = self.hold.lock().take();
        if let Some(hold) = hold {
            hold.release();
            debug!(checkpoint = %self.checkpoint, "Released commit hold");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ShardId;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn copy_state(released: Arc<AtomicBool>) -> CopyState {
        let checkpoint = ReplicationCheckpoint::new(ShardId::new("logs", 0), 1, 5, 10);
        CopyState::from_commit(
            checkpoint.clone(),
            IndexCommitRef {
                checkpoint,
                files: vec![
                    FileMetadata::new("_0.cfs", 100, "a1"),
                    FileMetadata::new("_0.si", 20, "b2"),
                    FileMetadata::new("segments_5", 7, "c3"),
                ],
                segment_infos: Bytes::from_static(b"infos"),
                hold: CommitHold::new(move || released.store(true, Ordering::SeqCst)),
            },
        )
    }

    #[test]
    fn test_starts_with_one_reference() {
        let state = copy_state(Arc::new(AtomicBool::new(false)));
        assert_eq!(state.ref_count(), 1);
        assert_eq!(state.total_bytes(), 127);
        assert_eq!(state.manifest().as_ref(), b"infos");
    }

    #[test]
    fn test_dec_ref_is_checked() {
        let state = copy_state(Arc::new(AtomicBool::new(false)));
        assert_eq!(state.inc_ref(), 2);
        assert_eq!(state.dec_ref(), Some(1));
        assert_eq!(state.dec_ref(), Some(0));
        assert_eq!(state.dec_ref(), None);
        assert_eq!(state.ref_count(), 0);
    }

    #[test]
    fn test_release_commit_once() {
        let released = Arc::new(AtomicBool::new(false));
        let state = copy_state(released.clone());
        assert!(state.is_held());
        state.release_commit();
        assert!(released.load(Ordering::SeqCst));
        assert!(!state.is_held());
        state.release_commit();
    }

    #[test]
    fn test_files_for_subset_keeps_snapshot_order() {
        let state = copy_state(Arc::new(AtomicBool::new(false)));
        let files = state
            .files_for(&["segments_5".to_string(), "_0.cfs".to_string()])
            .unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["_0.cfs", "segments_5"]);

        assert_eq!(state.files_for(&[]).unwrap().len(), 3);
    }

    #[test]
    fn test_files_for_unknown_file() {
        let state = copy_state(Arc::new(AtomicBool::new(false)));
        let err = state.files_for(&["_9.cfs".to_string()]).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Replication(ReplicationError::FileNotInSnapshot { .. })
        ));
    }
}
