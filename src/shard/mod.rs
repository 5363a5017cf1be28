//! The primary shard as seen by the replication coordinator.
//!
//! The storage engine, the shard registry and the routing table live outside
//! this crate; they are reached through the traits below. Primary permits and
//! the replication tracker are implemented here because the track-shard
//! handshake depends on their exact semantics.

mod permits;
mod tracker;

pub use permits::{PrimaryPermit, PrimaryPermits};
pub use tracker::{
    peer_recovery_lease_id, CheckpointState, ReplicationTracker, RetentionLease,
    PEER_RECOVERY_LEASE_SOURCE,
};

use crate::error::Result;
use crate::replication::{FileMetadata, ReplicationCheckpoint};
use crate::types::{AllocationId, ShardId};
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A hold on a commit point.
///
/// While the hold is alive the engine keeps every file of the commit on disk.
/// The release callback runs exactly once, either through [`CommitHold::release`]
/// or when the hold is dropped.
pub struct CommitHold {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl CommitHold {
    /// Create a hold that runs `release` when let go.
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A hold with nothing to release.
    pub fn noop() -> Self {
        Self { release: None }
    }

    /// Release the commit now.
    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for CommitHold {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for CommitHold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitHold")
            .field("held", &self.release.is_some())
            .finish()
    }
}

/// The last durable commit of a shard, pinned by a [`CommitHold`].
#[derive(Debug)]
pub struct IndexCommitRef {
    /// Checkpoint the commit corresponds to.
    pub checkpoint: ReplicationCheckpoint,

    /// Files of the commit in the engine's order.
    pub files: Vec<FileMetadata>,

    /// Serialized segment infos describing the commit.
    pub segment_infos: Bytes,

    /// Keeps the files alive.
    pub hold: CommitHold,
}

/// A primary shard hosted on this node.
#[async_trait::async_trait]
pub trait IndexShard: Send + Sync + fmt::Debug {
    /// Identity of the shard.
    fn shard_id(&self) -> &ShardId;

    /// Pin the latest durable commit and describe its files.
    fn acquire_last_index_commit(&self) -> Result<IndexCommitRef>;

    /// Read up to `len` bytes of `file` starting at `offset`.
    async fn read_file_chunk(&self, file: &str, offset: u64, len: usize) -> Result<Bytes>;

    /// Permits guarding shard state against relocation.
    fn primary_permits(&self) -> &PrimaryPermits;

    /// In-sync tracking state of the replication group.
    fn replication_tracker(&self) -> &ReplicationTracker;

    /// Sink for transfer byte and throttle accounting.
    fn throttle_tracker(&self) -> &dyn ThrottleTracker;

    /// Whether the shard has been closed.
    fn is_closed(&self) -> bool {
        self.primary_permits().is_closed()
    }
}

/// Lookup of shards hosted on this node.
pub trait IndicesService: Send + Sync {
    /// The shard with the given id, if hosted here.
    fn shard(&self, shard_id: &ShardId) -> Option<Arc<dyn IndexShard>>;
}

/// This node's view of the cluster routing table.
pub trait RoutingTable: Send + Sync {
    /// Whether the shard's routing table contains the allocation.
    fn has_allocation(&self, shard_id: &ShardId, allocation_id: &AllocationId) -> bool;
}

/// Receives per-transfer accounting.
pub trait ThrottleTracker: Send + Sync {
    /// Time a transfer spent waiting on the rate limiter.
    fn add_throttle_time(&self, throttled: Duration);

    /// Payload bytes delivered to a replica.
    fn add_bytes_sent(&self, bytes: u64);
}

/// Atomic [`ThrottleTracker`] a shard can embed.
#[derive(Debug, Default)]
pub struct ShardTransferStats {
    throttle_nanos: AtomicU64,
    bytes_sent: AtomicU64,
}

impl ShardTransferStats {
    /// Create zeroed stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total throttle time recorded.
    pub fn throttle_time(&self) -> Duration {
        Duration::from_nanos(self.throttle_nanos.load(Ordering::Relaxed))
    }

    /// Total bytes recorded.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

impl ThrottleTracker for ShardTransferStats {
    fn add_throttle_time(&self, throttled: Duration) {
        self.throttle_nanos
            .fetch_add(throttled.as_nanos() as u64, Ordering::Relaxed);
    }

    fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_commit_hold_releases_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let hold = CommitHold::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        hold.release();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_commit_hold_releases_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        {
            let _hold = CommitHold::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_transfer_stats_accumulate() {
        let stats = ShardTransferStats::new();
        stats.add_bytes_sent(100);
        stats.add_bytes_sent(28);
        stats.add_throttle_time(Duration::from_millis(3));
        assert_eq!(stats.bytes_sent(), 128);
        assert_eq!(stats.throttle_time(), Duration::from_millis(3));
    }
}
