//! Testing utilities for the replication coordinator.
//!
//! In-memory stand-ins for the collaborators the coordinator talks to, and
//! scenario tests that drive whole request flows through them.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Test harness                              │
//! │                                                                  │
//! │   FakeIndices ──► FakeShard (commit in memory, permits, tracker) │
//! │   FakeRouting     (allocations added on demand or after delay)   │
//! │   RecordingSenderFactory ──► RecordingChunkSender                │
//! │                               (max chunks / files in flight,     │
//! │                                injected failures)                │
//! │   ReplicaChunkStore           (replica end of the TCP transport) │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

mod fakes;

mod track_shard_tests;

pub use fakes::{
    FakeIndices, FakeRouting, FakeShard, RecordingChunkSender, RecordingSenderFactory,
    ReplicaChunkStore,
};

use crate::config::ReplicationConfig;
use crate::error::Result;
use crate::replication::ReplicationCoordinator;
use crate::types::{NodeId, ShardId};
use std::sync::Arc;

/// Node the fake primaries live on.
pub const PRIMARY_NODE: NodeId = 1;

/// A coordinator wired to in-memory collaborators.
pub struct TestPrimary {
    pub coordinator: Arc<ReplicationCoordinator>,
    pub indices: Arc<FakeIndices>,
    pub routing: Arc<FakeRouting>,
    pub senders: Arc<RecordingSenderFactory>,
}

impl TestPrimary {
    /// Build a primary around `sender` with the given settings.
    pub fn new(config: ReplicationConfig, sender: RecordingChunkSender) -> Result<Self> {
        let indices = Arc::new(FakeIndices::new());
        let routing = Arc::new(FakeRouting::new());
        let senders = Arc::new(RecordingSenderFactory::new(Arc::new(sender)));
        let coordinator = Arc::new(ReplicationCoordinator::new(
            config,
            indices.clone(),
            routing.clone(),
            senders.clone(),
        )?);
        Ok(Self {
            coordinator,
            indices,
            routing,
            senders,
        })
    }

    /// Host a new shard on this primary.
    pub fn add_shard(&self, shard_id: ShardId) -> Arc<FakeShard> {
        let shard = Arc::new(FakeShard::new(shard_id, PRIMARY_NODE));
        self.indices.add(shard.clone());
        shard
    }

    pub fn sender(&self) -> &Arc<RecordingChunkSender> {
        self.senders.sender()
    }
}

/// Install a fmt subscriber honoring `RUST_LOG`; repeated calls are no-ops.
#[cfg(test)]
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
