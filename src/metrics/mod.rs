//! Metrics for the replication source.
//!
//! Prometheus-style counters and gauges covering the three request kinds:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   ReplicationMetrics                        │
//! │  ┌──────────────────┐ ┌──────────────────┐ ┌─────────────┐  │
//! │  │ checkpoint info  │ │ segment files    │ │ track shard │  │
//! │  │ - requests       │ │ - transfers      │ │ - success   │  │
//! │  │ - cache hits     │ │ - bytes / chunks │ │ - timeouts  │  │
//! │  │ - creations      │ │ - throttle time  │ │ - failures  │  │
//! │  └──────────────────┘ └──────────────────┘ └─────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod instruments;

pub use instruments::{Counter, Expose, Gauge};

use std::time::Duration;

/// Metrics recorded by the replication coordinator.
#[derive(Debug)]
pub struct ReplicationMetrics {
    // Checkpoint info
    /// Checkpoint info requests served.
    pub checkpoint_info_requests: Counter,
    /// Requests answered from an already cached snapshot.
    pub copy_state_cache_hits: Counter,
    /// Snapshots built from the current commit.
    pub copy_states_created: Counter,
    /// Snapshots currently cached.
    pub cached_copy_states: Gauge,

    // Segment files
    /// File requests for checkpoints with no cached snapshot.
    pub get_files_misses: Counter,
    /// Transfers started.
    pub transfers_started: Counter,
    /// Transfers that delivered every chunk.
    pub transfers_succeeded: Counter,
    /// Transfers that failed or were aborted.
    pub transfers_failed: Counter,
    /// Transfers in progress.
    pub active_transfers: Gauge,
    /// Payload bytes sent to replicas.
    pub bytes_sent: Counter,
    /// Chunks sent to replicas.
    pub chunks_sent: Counter,
    /// Time spent waiting on the outbound rate limiter, in milliseconds.
    pub throttle_time_ms: Counter,

    // Track shard
    /// Replicas marked in-sync.
    pub track_shard_success: Counter,
    /// Track requests that gave up waiting for the routing table.
    pub track_shard_timeouts: Counter,
    /// Track requests that failed for any other reason.
    pub track_shard_failures: Counter,
}

impl ReplicationMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            checkpoint_info_requests: Counter::new(
                "segrep_checkpoint_info_requests_total",
                "Checkpoint info requests served",
            ),
            copy_state_cache_hits: Counter::new(
                "segrep_copy_state_cache_hits_total",
                "Checkpoint info requests answered from cache",
            ),
            copy_states_created: Counter::new(
                "segrep_copy_states_created_total",
                "Snapshots built from the current commit",
            ),
            cached_copy_states: Gauge::new("segrep_cached_copy_states", "Snapshots currently cached"),

            get_files_misses: Counter::new(
                "segrep_get_files_misses_total",
                "File requests for uncached checkpoints",
            ),
            transfers_started: Counter::new("segrep_transfers_started_total", "Transfers started"),
            transfers_succeeded: Counter::new(
                "segrep_transfers_succeeded_total",
                "Transfers completed successfully",
            ),
            transfers_failed: Counter::new("segrep_transfers_failed_total", "Transfers failed"),
            active_transfers: Gauge::new("segrep_active_transfers", "Transfers in progress"),
            bytes_sent: Counter::new("segrep_bytes_sent_total", "Payload bytes sent"),
            chunks_sent: Counter::new("segrep_chunks_sent_total", "Chunks sent"),
            throttle_time_ms: Counter::new(
                "segrep_throttle_time_ms_total",
                "Milliseconds spent waiting on the rate limiter",
            ),

            track_shard_success: Counter::new(
                "segrep_track_shard_success_total",
                "Replicas marked in-sync",
            ),
            track_shard_timeouts: Counter::new(
                "segrep_track_shard_timeouts_total",
                "Track requests timed out waiting for routing",
            ),
            track_shard_failures: Counter::new(
                "segrep_track_shard_failures_total",
                "Track requests failed",
            ),
        }
    }

    /// Record the outcome of a finished transfer.
    pub fn record_transfer(&self, success: bool, bytes: u64, chunks: u64, throttled: Duration) {
        if success {
            self.transfers_succeeded.inc();
        } else {
            self.transfers_failed.inc();
        }
        self.bytes_sent.inc_by(bytes);
        self.chunks_sent.inc_by(chunks);
        self.throttle_time_ms.inc_by(throttled.as_millis() as u64);
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            checkpoint_info_requests: self.checkpoint_info_requests.get(),
            copy_state_cache_hits: self.copy_state_cache_hits.get(),
            copy_states_created: self.copy_states_created.get(),
            cached_copy_states: self.cached_copy_states.get(),
            get_files_misses: self.get_files_misses.get(),
            transfers_started: self.transfers_started.get(),
            transfers_succeeded: self.transfers_succeeded.get(),
            transfers_failed: self.transfers_failed.get(),
            bytes_sent: self.bytes_sent.get(),
            track_shard_success: self.track_shard_success.get(),
            track_shard_timeouts: self.track_shard_timeouts.get(),
            track_shard_failures: self.track_shard_failures.get(),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        let counters = [
            &self.checkpoint_info_requests,
            &self.copy_state_cache_hits,
            &self.copy_states_created,
            &self.get_files_misses,
            &self.transfers_started,
            &self.transfers_succeeded,
            &self.transfers_failed,
            &self.bytes_sent,
            &self.chunks_sent,
            &self.throttle_time_ms,
            &self.track_shard_success,
            &self.track_shard_timeouts,
            &self.track_shard_failures,
        ];
        for counter in counters {
            counter.expose(&mut output);
        }
        self.cached_copy_states.expose(&mut output);
        self.active_transfers.expose(&mut output);

        output
    }
}

impl Default for ReplicationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the most useful metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub checkpoint_info_requests: u64,
    pub copy_state_cache_hits: u64,
    pub copy_states_created: u64,
    pub cached_copy_states: i64,
    pub get_files_misses: u64,
    pub transfers_started: u64,
    pub transfers_succeeded: u64,
    pub transfers_failed: u64,
    pub bytes_sent: u64,
    pub track_shard_success: u64,
    pub track_shard_timeouts: u64,
    pub track_shard_failures: u64,
}
