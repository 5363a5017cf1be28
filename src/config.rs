//! Configuration types for the replication coordinator.

use crate::error::{Error, Result};
use crate::types::NodeId;
use std::net::SocketAddr;
use std::time::Duration;

/// Largest frame the transport accepts, matching the server's hard cap.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Main configuration for a node acting as replication source.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Address to bind the replication transport on.
    pub bind_addr: SocketAddr,

    /// Segment file transfer settings.
    pub replication: ReplicationConfig,

    /// Transport timeouts and limits.
    pub network: NetworkConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9300)),
            replication: ReplicationConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Create a new configuration with the given node ID and address.
    pub fn new(node_id: NodeId, bind_addr: SocketAddr) -> Self {
        Self {
            node_id,
            bind_addr,
            ..Default::default()
        }
    }

    /// Set replication configuration.
    pub fn with_replication_config(mut self, replication: ReplicationConfig) -> Self {
        self.replication = replication;
        self
    }

    /// Set network configuration.
    pub fn with_network_config(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    /// Validate every nested section.
    pub fn validate(&self) -> Result<()> {
        self.replication.validate()?;
        self.network.validate()
    }
}

/// Settings for serving segment files to replicas.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Size of a single file chunk in bytes.
    pub chunk_size: usize,

    /// Maximum chunks in flight per transfer.
    pub max_concurrent_chunks: usize,

    /// Maximum files being sent at once per transfer.
    pub max_concurrent_file_operations: usize,

    /// Outbound byte rate limit. Zero disables throttling.
    pub max_bytes_per_sec: u64,

    /// How often the routing table is re-checked while a replica waits to be tracked.
    pub routing_poll_interval: Duration,

    /// How long a track-shard request waits for the allocation to become visible.
    pub routing_wait_timeout: Duration,

    /// How long to wait for a primary permit.
    pub permit_acquire_timeout: Duration,

    /// How long a tracked replica may lag the global checkpoint before the
    /// track-shard request gives up.
    pub in_sync_timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512 * 1024,
            max_concurrent_chunks: 2,
            max_concurrent_file_operations: 1,
            max_bytes_per_sec: 40 * 1024 * 1024,
            routing_poll_interval: Duration::from_millis(100),
            routing_wait_timeout: Duration::from_secs(30),
            permit_acquire_timeout: Duration::from_secs(30),
            in_sync_timeout: Duration::from_secs(30),
        }
    }
}

impl ReplicationConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the chunk size.
    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Set the chunk concurrency cap.
    pub fn with_max_concurrent_chunks(mut self, max: usize) -> Self {
        self.max_concurrent_chunks = max;
        self
    }

    /// Set the file operation concurrency cap.
    pub fn with_max_concurrent_file_operations(mut self, max: usize) -> Self {
        self.max_concurrent_file_operations = max;
        self
    }

    /// Set the outbound rate limit.
    pub fn with_max_bytes_per_sec(mut self, rate: u64) -> Self {
        self.max_bytes_per_sec = rate;
        self
    }

    /// Disable outbound throttling.
    pub fn unthrottled(mut self) -> Self {
        self.max_bytes_per_sec = 0;
        self
    }

    /// Set the routing table poll interval.
    pub fn with_routing_poll_interval(mut self, interval: Duration) -> Self {
        self.routing_poll_interval = interval;
        self
    }

    /// Set how long a track-shard request waits for routing visibility.
    pub fn with_routing_wait_timeout(mut self, timeout: Duration) -> Self {
        self.routing_wait_timeout = timeout;
        self
    }

    /// Set the primary permit timeout.
    pub fn with_permit_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.permit_acquire_timeout = timeout;
        self
    }

    /// Set how long a lagging replica may take to become in-sync.
    pub fn with_in_sync_timeout(mut self, timeout: Duration) -> Self {
        self.in_sync_timeout = timeout;
        self
    }

    /// Check that the settings can drive a transfer.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be positive".to_string()));
        }
        // A chunk travels inside one frame together with its metadata.
        if self.chunk_size > MAX_FRAME_BYTES / 2 {
            return Err(Error::Config(format!(
                "chunk_size {} exceeds the transport limit of {} bytes",
                self.chunk_size,
                MAX_FRAME_BYTES / 2
            )));
        }
        if self.max_concurrent_chunks == 0 {
            return Err(Error::Config(
                "max_concurrent_chunks must be positive".to_string(),
            ));
        }
        if self.max_concurrent_file_operations == 0 {
            return Err(Error::Config(
                "max_concurrent_file_operations must be positive".to_string(),
            ));
        }
        if self.routing_poll_interval.is_zero() {
            return Err(Error::Config(
                "routing_poll_interval must be positive".to_string(),
            ));
        }
        if self.routing_poll_interval > self.routing_wait_timeout {
            return Err(Error::Config(
                "routing_poll_interval must not exceed routing_wait_timeout".to_string(),
            ));
        }
        if self.in_sync_timeout.is_zero() {
            return Err(Error::Config("in_sync_timeout must be positive".to_string()));
        }
        Ok(())
    }
}

/// Transport timeouts.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,

    /// Timeout for a full request/response exchange.
    pub request_timeout: Duration,

    /// Largest accepted frame.
    pub max_frame_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }
}

impl NetworkConfig {
    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_frame_bytes == 0 || self.max_frame_bytes > MAX_FRAME_BYTES {
            return Err(Error::Config(format!(
                "max_frame_bytes must be in 1..={}",
                MAX_FRAME_BYTES
            )));
        }
        Ok(())
    }
}
