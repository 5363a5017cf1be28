//! Primary-side request handlers for segment replication.
//!
//! ```text
//!  replica                          primary (ReplicationCoordinator)
//!  ───────                          ────────────────────────────────
//!  GetCheckpointInfo(cp) ─────────► cache.get_or_create(cp) ──► manifest
//!  GetSegmentFiles(cp)   ─────────► cache.lookup(cp)
//!                                     ├─ miss ──► empty response
//!                                     └─ hit  ──► transfer task ──► FileChunk* ──► replica
//!                                                  └─ release guard: cache.release(cp)
//!  TrackShard(alloc)     ─────────► wait for routing ──► permit { lease, track,
//!                                                        local checkpoint, in-sync,
//!                                                        wait if lagging } ──► ack
//! ```
//!
//! Handlers share no state besides the snapshot cache and the shards they
//! resolve through [`IndicesService`].

use super::cache::CopyStateCache;
use super::checkpoint::ReplicationCheckpoint;
use super::copy_state::CopyState;
use super::throttle::RateLimiter;
use super::tracking::{track_replica, wait_for_allocation, RoutingWait, TrackingTimeouts};
use super::transfer::{ChunkSenderFactory, SegmentFileTransferHandler, TransferSettings};
use crate::config::ReplicationConfig;
use crate::error::{Error, ReplicationError, Result};
use crate::metrics::ReplicationMetrics;
use crate::network::{
    CheckpointInfoRequest, CheckpointInfoResponse, GetSegmentFilesRequest,
    GetSegmentFilesResponse, HandlerRegistry, Message, MessageHandler, TrackShardRequest,
    TrackShardResponse, GET_CHECKPOINT_INFO, GET_SEGMENT_FILES, TRACK_SHARD,
};
use crate::shard::{IndexShard, IndicesService, RoutingTable};
use crate::types::ShardId;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Serves checkpoint metadata, segment files and shard tracking to replicas.
pub struct ReplicationCoordinator {
    config: ReplicationConfig,
    indices: Arc<dyn IndicesService>,
    routing: Arc<dyn RoutingTable>,
    sender_factory: Arc<dyn ChunkSenderFactory>,
    cache: Arc<CopyStateCache>,
    rate_limiter: RwLock<Option<Arc<RateLimiter>>>,
    metrics: Arc<ReplicationMetrics>,
    /// Parent of every wait and transfer token.
    shutdown: CancellationToken,
    /// Per-shard tokens cancelled when the shard closes.
    shard_tokens: DashMap<ShardId, CancellationToken>,
}

impl ReplicationCoordinator {
    /// Create a coordinator with fresh metrics.
    ///
    /// Fails with [`Error::Config`] when `config` does not validate.
    pub fn new(
        config: ReplicationConfig,
        indices: Arc<dyn IndicesService>,
        routing: Arc<dyn RoutingTable>,
        sender_factory: Arc<dyn ChunkSenderFactory>,
    ) -> Result<Self> {
        Self::with_metrics(
            config,
            indices,
            routing,
            sender_factory,
            Arc::new(ReplicationMetrics::new()),
        )
    }

    /// Create a coordinator reporting into `metrics`.
    pub fn with_metrics(
        config: ReplicationConfig,
        indices: Arc<dyn IndicesService>,
        routing: Arc<dyn RoutingTable>,
        sender_factory: Arc<dyn ChunkSenderFactory>,
        metrics: Arc<ReplicationMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        let rate_limiter = RateLimiter::new(config.max_bytes_per_sec).map(Arc::new);
        Ok(Self {
            cache: Arc::new(CopyStateCache::new(metrics.clone())),
            config,
            indices,
            routing,
            sender_factory,
            rate_limiter: RwLock::new(rate_limiter),
            metrics,
            shutdown: CancellationToken::new(),
            shard_tokens: DashMap::new(),
        })
    }

    /// Bind the three replication actions to this coordinator.
    pub fn register_handlers(self: &Arc<Self>, registry: &HandlerRegistry) {
        for action in [GET_CHECKPOINT_INFO, GET_SEGMENT_FILES, TRACK_SHARD] {
            registry.register(action, self.clone());
        }
    }

    pub fn cache(&self) -> &Arc<CopyStateCache> {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<ReplicationMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Change the outbound rate limit. Zero disables throttling.
    pub fn set_max_bytes_per_sec(&self, rate: u64) {
        let mut limiter = self.rate_limiter.write();
        match (rate, limiter.as_ref()) {
            (0, _) => *limiter = None,
            (rate, Some(existing)) => existing.set_rate(rate),
            (rate, None) => *limiter = RateLimiter::new(rate).map(Arc::new),
        }
        info!(rate, "Updated segment replication rate limit");
    }

    /// Serve the manifest of `request.checkpoint`, snapshotting the current commit if needed.
    #[tracing::instrument(skip(self, request), fields(checkpoint = %request.checkpoint, target = request.target_node.id))]
    pub async fn handle_checkpoint_info(
        &self,
        request: CheckpointInfoRequest,
    ) -> Result<CheckpointInfoResponse> {
        self.metrics.checkpoint_info_requests.inc();
        let shard = self.resolve_shard(&request.checkpoint.shard_id)?;

        let copy_state = self.cache.get_or_create(&request.checkpoint, || {
            CopyState::from_shard(request.checkpoint.clone(), shard.as_ref())
        })?;

        debug!(
            files = copy_state.files().len(),
            bytes = copy_state.total_bytes(),
            "Serving checkpoint info"
        );
        Ok(CheckpointInfoResponse {
            request_id: request.request_id,
            checkpoint: copy_state.checkpoint().clone(),
            files: copy_state.files().to_vec(),
            manifest: copy_state.manifest().clone(),
        })
    }

    /// Push the requested files of a cached snapshot to the replica.
    ///
    /// An uncached checkpoint is answered with an empty response. The cached
    /// reference is released exactly once when the transfer task finishes,
    /// however it finishes.
    #[tracing::instrument(skip(self, request), fields(checkpoint = %request.checkpoint, target = request.target_node.id))]
    pub async fn handle_get_segment_files(
        &self,
        request: GetSegmentFilesRequest,
    ) -> Result<GetSegmentFilesResponse> {
        let Some(copy_state) = self.cache.lookup(&request.checkpoint) else {
            self.metrics.get_files_misses.inc();
            debug!("No cached copy state, nothing to send");
            return Ok(GetSegmentFilesResponse::empty(request.request_id));
        };

        self.metrics.active_transfers.inc();
        let guard = ReleaseGuard {
            cache: self.cache.clone(),
            metrics: self.metrics.clone(),
            checkpoint: request.checkpoint.clone(),
        };

        let shard = self.resolve_shard(&request.checkpoint.shard_id)?;
        let files = copy_state.files_for(&request.files_to_fetch)?;
        let sender = self
            .sender_factory
            .create(&request.target_node, &request.target_allocation_id);
        let handler = SegmentFileTransferHandler::new(
            shard,
            &copy_state,
            request.target_node.clone(),
            sender,
            TransferSettings::from(&self.config),
            self.rate_limiter.read().clone(),
            self.shard_token(&request.checkpoint.shard_id).child_token(),
        );

        self.metrics.transfers_started.inc();
        let task = tokio::spawn(async move {
            let _release = guard;
            let outcome = handler.send_files(files).await;
            (outcome, handler.progress())
        });

        let (outcome, progress) = match task.await {
            Ok(finished) => finished,
            Err(e) => (
                Err(Error::Internal(format!("transfer task failed: {}", e))),
                Default::default(),
            ),
        };

        match outcome {
            Ok(summary) => {
                self.metrics
                    .record_transfer(true, summary.bytes, summary.chunks, summary.throttle_time);
                let files = summary
                    .files
                    .iter()
                    .filter_map(|name| copy_state.file(name).cloned())
                    .collect();
                Ok(GetSegmentFilesResponse {
                    request_id: request.request_id,
                    files,
                    summary: Some(summary),
                })
            }
            Err(e) => {
                // Chunks acknowledged before the failure still count.
                self.metrics.record_transfer(
                    false,
                    progress.bytes,
                    progress.chunks,
                    progress.throttle_time,
                );
                Err(e)
            }
        }
    }

    /// Add the replica to the shard's in-sync set once the routing table knows it.
    #[tracing::instrument(
        skip(self, request),
        fields(
            shard_id = %request.registration.shard_id,
            allocation_id = %request.registration.target_allocation_id
        )
    )]
    pub async fn handle_track_shard(&self, request: TrackShardRequest) -> Result<TrackShardResponse> {
        let registration = &request.registration;
        let result = async {
            let shard = self.resolve_shard(&registration.shard_id)?;
            let waited = wait_for_allocation(
                self.routing.as_ref(),
                &registration.shard_id,
                &registration.target_allocation_id,
                RoutingWait {
                    poll_interval: self.config.routing_poll_interval,
                    timeout: self.config.routing_wait_timeout,
                },
                &self.shutdown,
            )
            .await?;
            debug!(waited_ms = waited.as_millis() as u64, "Allocation visible in routing table");

            track_replica(
                shard.as_ref(),
                registration,
                TrackingTimeouts {
                    permit: self.config.permit_acquire_timeout,
                    in_sync: self.config.in_sync_timeout,
                },
                &self.shutdown,
            )
            .await
        }
        .await;

        match result {
            Ok(()) => {
                self.metrics.track_shard_success.inc();
                Ok(TrackShardResponse {
                    request_id: request.request_id,
                    in_sync: true,
                })
            }
            Err(e) => {
                if matches!(
                    e,
                    Error::Replication(
                        ReplicationError::RoutingTimeout { .. }
                            | ReplicationError::InSyncTimeout { .. }
                    )
                ) {
                    self.metrics.track_shard_timeouts.inc();
                } else {
                    self.metrics.track_shard_failures.inc();
                }
                warn!(error = %e, "Failed to track replica");
                Err(e)
            }
        }
    }

    /// Drop cached snapshots of a closing shard and abort its transfers.
    pub fn before_shard_closed(&self, shard_id: &ShardId) {
        if let Some((_, token)) = self.shard_tokens.remove(shard_id) {
            token.cancel();
        }
        let removed = self.cache.invalidate_shard(shard_id);
        info!(%shard_id, removed, "Shard closing, replication state cleared");
    }

    /// Abort pending routing waits and in-flight transfers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.shard_tokens.clear();
        info!("Replication coordinator shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn resolve_shard(&self, shard_id: &ShardId) -> Result<Arc<dyn IndexShard>> {
        self.indices
            .shard(shard_id)
            .ok_or_else(|| Error::ShardNotFound(shard_id.clone()))
    }

    fn shard_token(&self, shard_id: &ShardId) -> CancellationToken {
        self.shard_tokens
            .entry(shard_id.clone())
            .or_insert_with(|| self.shutdown.child_token())
            .clone()
    }
}

impl std::fmt::Debug for ReplicationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationCoordinator")
            .field("config", &self.config)
            .field("cached_copy_states", &self.cache.len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[async_trait::async_trait]
impl MessageHandler for ReplicationCoordinator {
    async fn handle(&self, msg: Message) -> Option<Message> {
        let request_id = msg.request_id();
        let response = match msg {
            Message::GetCheckpointInfo(request) => self
                .handle_checkpoint_info(request)
                .await
                .map(Message::CheckpointInfo),
            Message::GetSegmentFiles(request) => self
                .handle_get_segment_files(request)
                .await
                .map(Message::SegmentFiles),
            Message::TrackShard(request) => self
                .handle_track_shard(request)
                .await
                .map(Message::TrackShardAck),
            other => Err(Error::Internal(format!(
                "unsupported message {}",
                other.kind()
            ))),
        };
        Some(response.unwrap_or_else(|e| Message::error(request_id, &e)))
    }
}

/// Gives back one cached reference when the transfer task ends.
struct ReleaseGuard {
    cache: Arc<CopyStateCache>,
    metrics: Arc<ReplicationMetrics>,
    checkpoint: ReplicationCheckpoint,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.metrics.active_transfers.dec();
        if !self.cache.release(&self.checkpoint) {
            debug!(checkpoint = %self.checkpoint, "Copy state already gone at transfer end");
        }
    }
}
