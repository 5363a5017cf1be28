//! Chunked push of a snapshot's files to one replica.
//!
//! ```text
//!   files ──► [file semaphore: M] ──► per-file task
//!                                        │ shard closed? ──► ShardClosed
//!                                        │ rate limiter pause
//!                                        │ read chunk, crc32c
//!                                        ▼
//!                              [chunk semaphore: N] ──► sender.send_chunk()
//! ```
//!
//! The first failure cancels the transfer token. Per-file tasks stop
//! scheduling chunks, their in-flight chunk sends are aborted, and the
//! failure is reported once to the caller. Nothing is retried here; a replica
//! retries by issuing a new file request.

use super::checkpoint::{FileMetadata, ReplicationCheckpoint};
use super::copy_state::CopyState;
use super::throttle::RateLimiter;
use crate::config::ReplicationConfig;
use crate::error::{Error, ReplicationError, Result};
use crate::shard::IndexShard;
use crate::types::{AllocationId, NodeDescriptor};
use bytes::Bytes;
use crc::{Crc, CRC_32_ISCSI};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// CRC-32C of a chunk payload.
pub fn chunk_checksum(content: &[u8]) -> u32 {
    CRC32C.checksum(content)
}

/// One piece of a segment file on its way to a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    /// Checkpoint the file belongs to.
    pub checkpoint: ReplicationCheckpoint,
    /// Metadata of the whole file.
    pub file: FileMetadata,
    /// Byte offset of `content` within the file.
    pub position: u64,
    pub content: Bytes,
    /// Set on the final chunk of the file.
    pub last_chunk: bool,
    /// CRC-32C of `content`.
    pub crc32c: u32,
}

impl FileChunk {
    /// Whether the payload matches its checksum.
    pub fn verify(&self) -> bool {
        chunk_checksum(&self.content) == self.crc32c
    }
}

/// Delivers chunks to one replica. Completes once the replica acknowledged the chunk.
#[async_trait::async_trait]
pub trait FileChunkSender: Send + Sync {
    async fn send_chunk(&self, chunk: FileChunk) -> Result<()>;
}

/// Builds a [`FileChunkSender`] bound to the replica that requested files.
pub trait ChunkSenderFactory: Send + Sync {
    fn create(
        &self,
        target: &NodeDescriptor,
        target_allocation_id: &AllocationId,
    ) -> Arc<dyn FileChunkSender>;
}

/// Limits of a single transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSettings {
    pub chunk_size: usize,
    pub max_concurrent_chunks: usize,
    pub max_concurrent_file_operations: usize,
}

impl TransferSettings {
    /// Reject limits that could never move a byte.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be positive".to_string()));
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
        Ok(())
    }
}

impl From<&ReplicationConfig> for TransferSettings {
    fn from(config: &ReplicationConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            max_concurrent_chunks: config.max_concurrent_chunks,
            max_concurrent_file_operations: config.max_concurrent_file_operations,
        }
    }
}

/// Outcome of a completed transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSummary {
    /// Names of the files sent, in snapshot order.
    pub files: Vec<String>,
    pub chunks: u64,
    pub bytes: u64,
    /// Time spent waiting on the rate limiter.
    pub throttle_time: Duration,
    pub elapsed: Duration,
}

/// Chunks acknowledged so far, for transfers that did not finish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
    pub chunks: u64,
    pub bytes: u64,
    pub throttle_time: Duration,
}

/// Pushes files of one [`CopyState`] to one replica.
pub struct SegmentFileTransferHandler {
    ctx: Arc<TransferContext>,
    settings: TransferSettings,
}

struct TransferContext {
    shard: Arc<dyn IndexShard>,
    checkpoint: ReplicationCheckpoint,
    target: NodeDescriptor,
    sender: Arc<dyn FileChunkSender>,
    rate_limiter: Option<Arc<RateLimiter>>,
    chunk_size: usize,
    chunk_permits: Arc<Semaphore>,
    cancel: CancellationToken,
    failure: Mutex<Option<Error>>,
    chunks: AtomicU64,
    bytes: AtomicU64,
    throttle_nanos: AtomicU64,
}

impl SegmentFileTransferHandler {
    /// Create a handler. Cancelling `cancel` aborts the transfer.
    pub fn new(
        shard: Arc<dyn IndexShard>,
        copy_state: &CopyState,
        target: NodeDescriptor,
        sender: Arc<dyn FileChunkSender>,
        settings: TransferSettings,
        rate_limiter: Option<Arc<RateLimiter>>,
        cancel: CancellationToken,
    ) -> Self {
        let ctx = TransferContext {
            shard,
            checkpoint: copy_state.checkpoint().clone(),
            target,
            sender,
            rate_limiter,
            chunk_size: settings.chunk_size,
            chunk_permits: Arc::new(Semaphore::new(settings.max_concurrent_chunks)),
            cancel,
            failure: Mutex::new(None),
            chunks: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            throttle_nanos: AtomicU64::new(0),
        };
        Self {
            ctx: Arc::new(ctx),
            settings,
        }
    }

    /// Acknowledged chunks and bytes, whether or not the transfer finished.
    pub fn progress(&self) -> TransferProgress {
        TransferProgress {
            chunks: self.ctx.chunks.load(Ordering::Acquire),
            bytes: self.ctx.bytes.load(Ordering::Acquire),
            throttle_time: Duration::from_nanos(self.ctx.throttle_nanos.load(Ordering::Acquire)),
        }
    }

    /// Token that aborts this transfer when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.ctx.cancel.clone()
    }

    /// Send `files` and wait until every chunk is acknowledged or the transfer fails.
    #[tracing::instrument(
        skip(self, files),
        fields(checkpoint = %self.ctx.checkpoint, target = self.ctx.target.id, files = files.len())
    )]
    pub async fn send_files(&self, files: Vec<FileMetadata>) -> Result<TransferSummary> {
        self.settings.validate()?;
        let start = Instant::now();
        let names: Vec<String> = files.iter().map(|f| f.name.clone()).collect();
        let file_permits = Arc::new(Semaphore::new(self.settings.max_concurrent_file_operations));
        let mut tasks = JoinSet::new();

        for file in files {
            let permit = tokio::select! {
                permit = file_permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.ctx.cancel.cancelled() => break,
            };

            let ctx = self.ctx.clone();
            tasks.spawn(async move {
                let _permit = permit;
                if let Err(e) = ctx.send_file(&file).await {
                    ctx.fail(e);
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                self.ctx.fail(join_error(e));
            }
        }

        file_permits.close();
        self.ctx.chunk_permits.close();

        let progress = self.progress();
        let summary = TransferSummary {
            files: names,
            chunks: progress.chunks,
            bytes: progress.bytes,
            throttle_time: progress.throttle_time,
            elapsed: start.elapsed(),
        };

        if self.ctx.cancel.is_cancelled() {
            let err = self.ctx.failure.lock().take().unwrap_or(Error::Cancelled);
            warn!(
                bytes = summary.bytes,
                chunks = summary.chunks,
                error = %err,
                "Segment file transfer failed"
            );
            return Err(self.ctx.surface(err));
        }

        info!(
            bytes = summary.bytes,
            chunks = summary.chunks,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Segment file transfer complete"
        );
        Ok(summary)
    }
}

impl std::fmt::Debug for SegmentFileTransferHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentFileTransferHandler")
            .field("checkpoint", &self.ctx.checkpoint)
            .field("target", &self.ctx.target)
            .field("settings", &self.settings)
            .finish()
    }
}

impl TransferContext {
    async fn send_file(self: &Arc<Self>, file: &FileMetadata) -> Result<()> {
        let chunk_count = file.chunk_count(self.chunk_size);
        let mut in_flight: JoinSet<Result<()>> = JoinSet::new();
        let mut position = 0u64;

        for index in 0..chunk_count {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if self.shard.is_closed() {
                return Err(ReplicationError::ShardClosed(self.shard.shard_id().clone()).into());
            }

            let permit = self.acquire_chunk_permit().await?;

            let len = (file.length - position).min(self.chunk_size as u64) as usize;
            if let Some(limiter) = &self.rate_limiter {
                let waited = limiter.pause(len as u64).await;
                if !waited.is_zero() {
                    self.throttle_nanos
                        .fetch_add(waited.as_nanos() as u64, Ordering::AcqRel);
                    self.shard.throttle_tracker().add_throttle_time(waited);
                }
            }

            let content = if len == 0 {
                Bytes::new()
            } else {
                self.shard.read_file_chunk(&file.name, position, len).await?
            };
            let chunk = FileChunk {
                checkpoint: self.checkpoint.clone(),
                file: file.clone(),
                position,
                crc32c: chunk_checksum(&content),
                content,
                last_chunk: index + 1 == chunk_count,
            };
            position += len as u64;

            let ctx = self.clone();
            in_flight.spawn(async move { ctx.send_chunk(chunk, permit).await });

            while let Some(joined) = in_flight.try_join_next() {
                self.account(joined)?;
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            self.account(joined)?;
        }
        debug!(file = %file.name, chunks = chunk_count, "File sent");
        Ok(())
    }

    async fn acquire_chunk_permit(&self) -> Result<OwnedSemaphorePermit> {
        tokio::select! {
            permit = self.chunk_permits.clone().acquire_owned() => {
                permit.map_err(|_| Error::Cancelled)
            }
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Send one chunk and count it once the replica acknowledged it.
    async fn send_chunk(&self, chunk: FileChunk, _permit: OwnedSemaphorePermit) -> Result<()> {
        let len = chunk.content.len() as u64;
        tokio::select! {
            // An acknowledgement that is already in is counted even if the transfer was cancelled.
            biased;
            sent = self.sender.send_chunk(chunk) => sent?,
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
        }
        self.chunks.fetch_add(1, Ordering::AcqRel);
        self.bytes.fetch_add(len, Ordering::AcqRel);
        self.shard.throttle_tracker().add_bytes_sent(len);
        Ok(())
    }

    fn account(&self, joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
        joined.map_err(join_error)?
    }

    /// Record the first real failure and stop the transfer.
    fn fail(&self, err: Error) {
        if !matches!(err, Error::Cancelled) {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(err);
            }
        }
        self.cancel.cancel();
    }

    fn surface(&self, err: Error) -> Error {
        match err {
            Error::Replication(_) | Error::Cancelled => err,
            other => ReplicationError::TransferAborted {
                target: self.target.id,
                reason: other.to_string(),
            }
            .into(),
        }
    }
}

fn join_error(e: JoinError) -> Error {
    if e.is_cancelled() {
        Error::Cancelled
    } else {
        Error::Internal(format!("transfer task panicked: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_checksum_is_crc32c() {
        // Standard CRC-32C check value.
        assert_eq!(chunk_checksum(b"123456789"), 0xE306_9283);
    }

    #[test]
    fn test_chunk_verify() {
        let content = Bytes::from_static(b"segment bytes");
        let mut chunk = FileChunk {
            checkpoint: ReplicationCheckpoint::empty(crate::types::ShardId::new("logs", 0)),
            file: FileMetadata::new("_0.cfs", 13, "x"),
            position: 0,
            crc32c: chunk_checksum(&content),
            content,
            last_chunk: true,
        };
        assert!(chunk.verify());
        chunk.crc32c ^= 1;
        assert!(!chunk.verify());
    }

    #[test]
    fn test_settings_reject_zero_limits() {
        let settings = TransferSettings {
            chunk_size: 1024,
            max_concurrent_chunks: 0,
            max_concurrent_file_operations: 1,
        };
        assert!(matches!(settings.validate(), Err(Error::Config(_))));

        let settings = TransferSettings {
            chunk_size: 0,
            max_concurrent_chunks: 1,
            max_concurrent_file_operations: 1,
        };
        assert!(matches!(settings.validate(), Err(Error::Config(_))));

        let settings = TransferSettings {
            chunk_size: 1024,
            max_concurrent_chunks: 1,
            max_concurrent_file_operations: 0,
        };
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_settings_from_config() {
        let config = ReplicationConfig::new()
            .with_chunk_size(1024)
            .with_max_concurrent_chunks(4)
            .with_max_concurrent_file_operations(2);
        let settings = TransferSettings::from(&config);
        assert_eq!(settings.chunk_size, 1024);
        assert_eq!(settings.max_concurrent_chunks, 4);
        assert_eq!(settings.max_concurrent_file_operations, 2);
    }
}
