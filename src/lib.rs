//! Primary-side coordinator for segment replication.
//!
//! Replicas of a shard do not re-index documents. They copy the primary's
//! durable segment files instead. This crate is the primary's half of that
//! exchange:
//!
//! - **Checkpoint info**: snapshot the latest commit once per checkpoint and
//!   hand every replica the same file manifest
//! - **Segment files**: push the files of a cached snapshot to a replica in
//!   CRC32C-checked chunks, bounded in concurrency and byte rate
//! - **Shard tracking**: once the replica's allocation is routable, add it to
//!   the primary's in-sync set under an operation permit
//!
//! # Example
//!
//! ```rust,no_run
//! use segrep::network::{HandlerRegistry, NetworkServer, RpcClient};
//! use segrep::replication::{RemoteChunkSenderFactory, ReplicationCoordinator};
//! use segrep::shard::{IndicesService, RoutingTable};
//! use segrep::CoordinatorConfig;
//! use std::sync::Arc;
//!
//! async fn serve(
//!     indices: Arc<dyn IndicesService>,
//!     routing: Arc<dyn RoutingTable>,
//! ) -> segrep::Result<()> {
//!     let config = CoordinatorConfig::new(1, "127.0.0.1:9300".parse().unwrap());
//!     config.validate()?;
//!
//!     let client = Arc::new(RpcClient::new(config.network.clone()));
//!     let coordinator = Arc::new(ReplicationCoordinator::new(
//!         config.replication.clone(),
//!         indices,
//!         routing,
//!         Arc::new(RemoteChunkSenderFactory::new(client)),
//!     )?);
//!
//!     let registry = Arc::new(HandlerRegistry::new());
//!     coordinator.register_handlers(&registry);
//!
//!     let (server, _shutdown) = NetworkServer::bind(
//!         config.bind_addr,
//!         config.node_id,
//!         registry,
//!         config.network.max_frame_bytes,
//!     )
//!     .await?;
//!     server.run().await
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │        NetworkServer + HandlerRegistry       │
//! └──────────────────────────────────────────────┘
//!                      │
//!                      ▼
//! ┌──────────────────────────────────────────────┐
//! │           ReplicationCoordinator             │
//! │  • handle_checkpoint_info                    │
//! │  • handle_get_segment_files                  │
//! │  • handle_track_shard                        │
//! └──────────────────────────────────────────────┘
//!                      │
//!      ┌───────────────┼────────────────┐
//!      ▼               ▼                ▼
//! ┌──────────┐   ┌────────────┐   ┌────────────┐
//! │CopyState │   │  Transfer  │   │  Tracker   │
//! │  Cache   │   │  Handler   │   │ + Permits  │
//! └──────────┘   └────────────┘   └────────────┘
//! ```
//!
//! # Resource lifetime
//!
//! A commit snapshot stays pinned while any replica still references it.
//! Every checkpoint info request takes a reference, every segment files
//! request gives one back when its transfer ends, and closing a shard drops
//! all of that shard's snapshots at once.

pub mod config;
pub mod error;
pub mod metrics;
pub mod network;
pub mod replication;
pub mod shard;
pub mod testing;
pub mod types;

pub use config::{CoordinatorConfig, NetworkConfig, ReplicationConfig};
pub use error::{Error, NetworkError, ReplicationError, Result};
pub use metrics::{MetricsSnapshot, ReplicationMetrics};
pub use replication::{
    CopyState, CopyStateCache, FileMetadata, PrimaryReplicationSource, ReplicationCheckpoint,
    ReplicationCoordinator,
};
pub use shard::{IndexShard, IndicesService, RoutingTable};
pub use types::{AllocationId, NodeDescriptor, NodeId, ShardId};
