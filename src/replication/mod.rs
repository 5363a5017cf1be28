//! Segment replication, primary side.
//!
//! A replica copies a primary's durable segment files in three steps, each a
//! separate request to the primary:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                      ReplicationCoordinator                        │
//! │                                                                    │
//! │   GetCheckpointInfo ──► CopyStateCache ◄── GetSegmentFiles         │
//! │                          │  (refcounted       │                    │
//! │                          │   CopyState)       ▼                    │
//! │                          │           SegmentFileTransferHandler    │
//! │                          │             ├─ RateLimiter              │
//! │                          │             └─ FileChunkSender ──► replica
//! │                          ▼                                         │
//! │                     IndexShard (commit hold, file reads)           │
//! │                                                                    │
//! │   TrackShard ──► RoutingTable wait ──► PrimaryPermit ──►           │
//! │                  ReplicationTracker (lease, tracking, in-sync)     │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The replica side of the exchange is [`PrimaryReplicationSource`].

mod cache;
mod checkpoint;
mod coordinator;
mod copy_state;
mod remote;
mod source;
mod throttle;
mod tracking;
mod transfer;

pub use cache::CopyStateCache;
pub use checkpoint::{FileMetadata, ReplicationCheckpoint};
pub use coordinator::ReplicationCoordinator;
pub use copy_state::CopyState;
pub use remote::{RemoteChunkSenderFactory, RemoteFileChunkWriter};
pub use source::PrimaryReplicationSource;
pub use throttle::RateLimiter;
pub use tracking::{
    track_replica, wait_for_allocation, RoutingWait, TrackingRegistration, TrackingTimeouts,
};
pub use transfer::{
    chunk_checksum, ChunkSenderFactory, FileChunk, FileChunkSender, SegmentFileTransferHandler,
    TransferProgress, TransferSettings, TransferSummary,
};
