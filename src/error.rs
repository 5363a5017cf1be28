//! Error types for segment replication.

use crate::types::{AllocationId, NodeId, ShardId};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the replication coordinator.
#[derive(Error, Debug)]
pub enum Error {
    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Replication protocol errors.
    #[error("replication error: {0}")]
    Replication(#[from] ReplicationError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// Shard not found on this node.
    #[error("shard not found: {0}")]
    ShardNotFound(ShardId),

    /// Error reported by the remote side of a request.
    #[error("remote error: {message}")]
    RemoteError { message: String, retryable: bool },
}

impl Error {
    /// Whether the caller may reissue the request and expect a different outcome.
    ///
    /// Routing waits, permit waits and transport failures are transient; everything
    /// else needs the caller to change something first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout | Error::Network(_) => true,
            Error::RemoteError { retryable, .. } => *retryable,
            Error::Replication(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Segment replication errors.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// The target allocation never showed up in the primary's routing table.
    #[error("allocation {allocation_id} of {shard_id} not visible in routing table after {waited:?}")]
    RoutingTimeout {
        shard_id: ShardId,
        allocation_id: AllocationId,
        waited: Duration,
    },

    /// A tracked replica did not catch up with the global checkpoint in time.
    #[error("allocation {allocation_id} still behind the global checkpoint after {waited:?}")]
    InSyncTimeout {
        allocation_id: AllocationId,
        waited: Duration,
    },

    /// The primary has no peer recovery retention lease to clone.
    #[error("retention lease not found: {0}")]
    RetentionLeaseNotFound(String),

    /// The target node already holds a peer recovery retention lease.
    #[error("retention lease already exists: {0}")]
    RetentionLeaseAlreadyExists(String),

    /// The allocation is not tracked by the replication tracker.
    #[error("allocation {0} is not tracked")]
    AllocationNotTracked(AllocationId),

    /// A replica asked for a file that is not part of the snapshot.
    #[error("file {file} is not part of the snapshot for {checkpoint}")]
    FileNotInSnapshot { file: String, checkpoint: String },

    /// The shard was closed while the operation was running.
    #[error("shard {0} is closed")]
    ShardClosed(ShardId),

    /// The primary has been relocated and no longer accepts permits.
    #[error("primary of {0} has been relocated")]
    PrimaryRelocated(ShardId),

    /// A file transfer was aborted before every chunk was acknowledged.
    #[error("transfer to node {target} aborted: {reason}")]
    TransferAborted { target: NodeId, reason: String },
}

impl ReplicationError {
    /// Whether the failure is transient from the replica's point of view.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplicationError::RoutingTimeout { .. }
                | ReplicationError::InSyncTimeout { .. }
                | ReplicationError::TransferAborted { .. }
                | ReplicationError::ShardClosed(_)
        )
    }
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Failed to send message.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Failed to receive message.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The peer answered with a message of the wrong kind.
    #[error("unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse {
        expected: &'static str,
        actual: &'static str,
    },

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}
