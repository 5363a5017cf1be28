//! Checkpoint and file metadata value types.

use crate::types::ShardId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Identifies a shard's durable segment state at one point in time.
///
/// Two checkpoints with equal fields describe the same commit and are
/// interchangeable as cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicationCheckpoint {
    /// Shard this checkpoint belongs to.
    pub shard_id: ShardId,

    /// Term of the primary that produced the commit.
    pub primary_term: u64,

    /// Generation of the commit point.
    pub segments_gen: u64,

    /// Version of the in-memory segment infos at the commit.
    pub segment_infos_version: u64,
}

impl ReplicationCheckpoint {
    /// Create a new checkpoint.
    pub fn new(
        shard_id: ShardId,
        primary_term: u64,
        segments_gen: u64,
        segment_infos_version: u64,
    ) -> Self {
        Self {
            shard_id,
            primary_term,
            segments_gen,
            segment_infos_version,
        }
    }

    /// An empty checkpoint for a shard that has not committed yet.
    pub fn empty(shard_id: ShardId) -> Self {
        Self::new(shard_id, 0, 0, 0)
    }

    /// Whether this checkpoint is strictly newer than `other` for the same shard.
    ///
    /// Checkpoints of different shards are never ordered.
    pub fn is_ahead_of(&self, other: &ReplicationCheckpoint) -> bool {
        self.shard_id == other.shard_id && self.marker().cmp(&other.marker()) == Ordering::Greater
    }

    fn marker(&self) -> (u64, u64, u64) {
        (self.primary_term, self.segments_gen, self.segment_infos_version)
    }
}

impl fmt::Display for ReplicationCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} term={} gen={} version={}",
            self.shard_id, self.primary_term, self.segments_gen, self.segment_infos_version
        )
    }
}

/// Name, length and checksum of one file in a commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileMetadata {
    /// File name relative to the shard's store.
    pub name: String,

    /// Length in bytes.
    pub length: u64,

    /// Checksum recorded by the engine for the whole file.
    pub checksum: String,
}

impl FileMetadata {
    /// Create new file metadata.
    pub fn new(name: impl Into<String>, length: u64, checksum: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            length,
            checksum: checksum.into(),
        }
    }

    /// Number of chunks of `chunk_size` bytes needed to send this file.
    ///
    /// An empty file still takes one (empty) chunk so the target learns it exists.
    pub fn chunk_count(&self, chunk_size: usize) -> u64 {
        if self.length == 0 {
            1
        } else {
            self.length.div_ceil(chunk_size as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn checkpoint(term: u64, gen: u64, version: u64) -> ReplicationCheckpoint {
        ReplicationCheckpoint::new(ShardId::new("logs", 0), term, gen, version)
    }

    #[test]
    fn test_equal_checkpoints_are_one_key() {
        let mut keys = HashSet::new();
        keys.insert(checkpoint(1, 5, 10));
        keys.insert(checkpoint(1, 5, 10));
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn test_is_ahead_of() {
        assert!(checkpoint(1, 6, 0).is_ahead_of(&checkpoint(1, 5, 99)));
        assert!(checkpoint(2, 1, 0).is_ahead_of(&checkpoint(1, 5, 99)));
        assert!(checkpoint(1, 5, 11).is_ahead_of(&checkpoint(1, 5, 10)));
        assert!(!checkpoint(1, 5, 10).is_ahead_of(&checkpoint(1, 5, 10)));

        let other_shard = ReplicationCheckpoint::new(ShardId::new("logs", 1), 9, 9, 9);
        assert!(!other_shard.is_ahead_of(&checkpoint(1, 5, 10)));
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(FileMetadata::new("_0.cfs", 0, "x").chunk_count(4), 1);
        assert_eq!(FileMetadata::new("_0.cfs", 4, "x").chunk_count(4), 1);
        assert_eq!(FileMetadata::new("_0.cfs", 9, "x").chunk_count(4), 3);
    }
}
