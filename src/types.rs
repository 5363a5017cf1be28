//! Core types used throughout the replication coordinator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Node identifier in the cluster.
pub type NodeId = u64;

/// Sequence number of a shard with no operations yet.
pub const NO_OPS_PERFORMED: i64 = -1;

/// Sequence number that has not been assigned.
pub const UNASSIGNED_SEQ_NO: i64 = -2;

/// Identity of a shard: the index it belongs to and its number within that index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    /// Name of the owning index.
    pub index: String,
    /// Shard number within the index.
    pub id: u32,
}

impl ShardId {
    /// Create a new shard id.
    pub fn new(index: impl Into<String>, id: u32) -> Self {
        Self {
            index: index.into(),
            id,
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index, self.id)
    }
}

/// Identifier of one shard copy (primary or replica) in the routing table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllocationId(String);

impl AllocationId {
    /// Create an allocation id from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random allocation id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// The string form of the id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Information about a node that takes part in replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Unique node identifier.
    pub id: NodeId,
    /// Address the node's transport listens on.
    pub addr: SocketAddr,
}

impl NodeDescriptor {
    /// Create a new node descriptor.
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}
