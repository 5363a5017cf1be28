//! In-memory collaborators for exercising the coordinator.

use crate::error::{Error, NetworkError, Result};
use crate::network::{FileChunkResponse, Message, MessageHandler};
use crate::replication::{
    ChunkSenderFactory, FileChunk, FileChunkSender, FileMetadata, ReplicationCheckpoint,
};
use crate::shard::{
    CommitHold, IndexCommitRef, IndexShard, IndicesService, PrimaryPermits, ReplicationTracker,
    RoutingTable, ShardTransferStats, ThrottleTracker,
};
use crate::types::{AllocationId, NodeDescriptor, NodeId, ShardId};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A primary shard whose commit lives in memory.
#[derive(Debug)]
pub struct FakeShard {
    shard_id: ShardId,
    checkpoint: RwLock<ReplicationCheckpoint>,
    files: RwLock<Vec<(FileMetadata, Bytes)>>,
    permits: PrimaryPermits,
    tracker: ReplicationTracker,
    stats: ShardTransferStats,
    holds_acquired: AtomicUsize,
    holds_released: Arc<AtomicUsize>,
    reads: AtomicUsize,
}

impl FakeShard {
    /// A primary at term 1 on `node_id` with an empty commit.
    pub fn new(shard_id: ShardId, node_id: NodeId) -> Self {
        let primary = AllocationId::new(format!("primary-{}-{}", shard_id.index, shard_id.id));
        Self {
            checkpoint: RwLock::new(ReplicationCheckpoint::empty(shard_id.clone())),
            files: RwLock::new(Vec::new()),
            permits: PrimaryPermits::new(shard_id.clone(), 1),
            tracker: ReplicationTracker::new(shard_id.clone(), node_id, primary, 1),
            stats: ShardTransferStats::new(),
            holds_acquired: AtomicUsize::new(0),
            holds_released: Arc::new(AtomicUsize::new(0)),
            reads: AtomicUsize::new(0),
            shard_id,
        }
    }

    /// Replace the current commit.
    pub fn set_commit(&self, segments_gen: u64, files: Vec<(&str, Vec<u8>)>) -> ReplicationCheckpoint {
        let checkpoint =
            ReplicationCheckpoint::new(self.shard_id.clone(), 1, segments_gen, segments_gen);
        let files = files
            .into_iter()
            .map(|(name, content)| {
                let meta = FileMetadata::new(
                    name,
                    content.len() as u64,
                    format!("{:08x}", crate::replication::chunk_checksum(&content)),
                );
                (meta, Bytes::from(content))
            })
            .collect();
        *self.files.write() = files;
        *self.checkpoint.write() = checkpoint.clone();
        checkpoint
    }

    /// Give the primary its own peer recovery lease so replicas can clone it.
    pub async fn add_primary_retention_lease(&self) -> Result<()> {
        let permit = self.permits.acquire(Duration::from_secs(5)).await?;
        self.tracker.add_peer_recovery_retention_lease(&permit, 0)?;
        Ok(())
    }

    /// Close the shard.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Commit holds not yet released.
    pub fn open_commit_holds(&self) -> usize {
        self.holds_acquired.load(Ordering::SeqCst) - self.holds_released.load(Ordering::SeqCst)
    }

    pub fn commit_holds_acquired(&self) -> usize {
        self.holds_acquired.load(Ordering::SeqCst)
    }

    pub fn chunk_reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn transfer_stats(&self) -> &ShardTransferStats {
        &self.stats
    }

    /// Content of a file in the current commit.
    pub fn file_content(&self, name: &str) -> Option<Bytes> {
        self.files
            .read()
            .iter()
            .find(|(meta, _)| meta.name == name)
            .map(|(_, content)| content.clone())
    }
}

#[async_trait::async_trait]
impl IndexShard for FakeShard {
    fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    fn acquire_last_index_commit(&self) -> Result<IndexCommitRef> {
        self.holds_acquired.fetch_add(1, Ordering::SeqCst);
        let released = self.holds_released.clone();
        Ok(IndexCommitRef {
            checkpoint: self.checkpoint.read().clone(),
            files: self.files.read().iter().map(|(m, _)| m.clone()).collect(),
            segment_infos: Bytes::from(format!("segments_{}", self.checkpoint.read().segments_gen)),
            hold: CommitHold::new(move || {
                released.fetch_add(1, Ordering::SeqCst);
            }),
        })
    }

    async fn read_file_chunk(&self, file: &str, offset: u64, len: usize) -> Result<Bytes> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let content = self
            .file_content(file)
            .ok_or_else(|| Error::Internal(format!("no such file {}", file)))?;
        let start = offset as usize;
        let end = start + len;
        if end > content.len() {
            return Err(Error::Internal(format!(
                "read past end of {}: {}..{} of {}",
                file,
                start,
                end,
                content.len()
            )));
        }
        Ok(content.slice(start..end))
    }

    fn primary_permits(&self) -> &PrimaryPermits {
        &self.permits
    }

    fn replication_tracker(&self) -> &ReplicationTracker {
        &self.tracker
    }

    fn throttle_tracker(&self) -> &dyn ThrottleTracker {
        &self.stats
    }
}

/// Shard registry backed by a map.
#[derive(Debug, Default)]
pub struct FakeIndices {
    shards: DashMap<ShardId, Arc<FakeShard>>,
}

impl FakeIndices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, shard: Arc<FakeShard>) {
        self.shards.insert(shard.shard_id.clone(), shard);
    }

    pub fn remove(&self, shard_id: &ShardId) {
        self.shards.remove(shard_id);
    }
}

impl IndicesService for FakeIndices {
    fn shard(&self, shard_id: &ShardId) -> Option<Arc<dyn IndexShard>> {
        self.shards
            .get(shard_id)
            .map(|s| s.value().clone() as Arc<dyn IndexShard>)
    }
}

/// Routing table whose allocations are added by the test.
#[derive(Debug, Default)]
pub struct FakeRouting {
    allocations: Mutex<HashSet<(ShardId, AllocationId)>>,
    lookups: AtomicUsize,
}

impl FakeRouting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, shard_id: &ShardId, allocation_id: &AllocationId) {
        self.allocations
            .lock()
            .insert((shard_id.clone(), allocation_id.clone()));
    }

    /// Add the allocation after `delay`, as cluster state application would.
    pub fn add_after(self: &Arc<Self>, shard_id: &ShardId, allocation_id: &AllocationId, delay: Duration) {
        let routing = self.clone();
        let shard_id = shard_id.clone();
        let allocation_id = allocation_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            routing.add(&shard_id, &allocation_id);
        });
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl RoutingTable for FakeRouting {
    fn has_allocation(&self, shard_id: &ShardId, allocation_id: &AllocationId) -> bool {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.allocations
            .lock()
            .contains(&(shard_id.clone(), allocation_id.clone()))
    }
}

#[derive(Default)]
struct InFlight {
    chunks: usize,
    per_file: HashMap<String, usize>,
}

/// Chunk sender that records what it is sent and how much overlapped.
#[derive(Default)]
pub struct RecordingChunkSender {
    chunks: Mutex<Vec<FileChunk>>,
    in_flight: Mutex<InFlight>,
    max_chunks_in_flight: AtomicUsize,
    max_files_in_flight: AtomicUsize,
    delay: Duration,
    fail_after: Option<usize>,
    attempts: AtomicUsize,
}

impl RecordingChunkSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every chunk for `delay` before acknowledging it.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail every send after the first `n`.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Chunks acknowledged so far.
    pub fn chunks(&self) -> Vec<FileChunk> {
        self.chunks.lock().clone()
    }

    pub fn max_chunks_in_flight(&self) -> usize {
        self.max_chunks_in_flight.load(Ordering::SeqCst)
    }

    pub fn max_files_in_flight(&self) -> usize {
        self.max_files_in_flight.load(Ordering::SeqCst)
    }

    /// Rebuild a file from acknowledged chunks by position.
    pub fn assemble(&self, file: &str) -> Vec<u8> {
        let by_position: BTreeMap<u64, Bytes> = self
            .chunks
            .lock()
            .iter()
            .filter(|c| c.file.name == file)
            .map(|c| (c.position, c.content.clone()))
            .collect();
        by_position.into_values().flat_map(|b| b.to_vec()).collect()
    }

    fn enter(&self, file: &str) {
        let mut in_flight = self.in_flight.lock();
        in_flight.chunks += 1;
        *in_flight.per_file.entry(file.to_string()).or_default() += 1;
        self.max_chunks_in_flight
            .fetch_max(in_flight.chunks, Ordering::SeqCst);
        self.max_files_in_flight
            .fetch_max(in_flight.per_file.len(), Ordering::SeqCst);
    }

    fn exit(&self, file: &str) {
        let mut in_flight = self.in_flight.lock();
        in_flight.chunks -= 1;
        if let Some(count) = in_flight.per_file.get_mut(file) {
            *count -= 1;
            if *count == 0 {
                in_flight.per_file.remove(file);
            }
        }
    }
}

struct InFlightGuard<'a> {
    sender: &'a RecordingChunkSender,
    file: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.sender.exit(&self.file);
    }
}

#[async_trait::async_trait]
impl FileChunkSender for RecordingChunkSender {
    async fn send_chunk(&self, chunk: FileChunk) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_after.is_some_and(|n| attempt >= n) {
            return Err(NetworkError::SendFailed("connection reset by replica".to_string()).into());
        }

        self.enter(&chunk.file.name);
        let _guard = InFlightGuard {
            sender: self,
            file: chunk.file.name.clone(),
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.chunks.lock().push(chunk);
        Ok(())
    }
}

/// Hands out one shared [`RecordingChunkSender`] and remembers the targets.
pub struct RecordingSenderFactory {
    sender: Arc<RecordingChunkSender>,
    targets: Mutex<Vec<(NodeId, AllocationId)>>,
}

impl RecordingSenderFactory {
    pub fn new(sender: Arc<RecordingChunkSender>) -> Self {
        Self {
            sender,
            targets: Mutex::new(Vec::new()),
        }
    }

    pub fn sender(&self) -> &Arc<RecordingChunkSender> {
        &self.sender
    }

    pub fn targets(&self) -> Vec<(NodeId, AllocationId)> {
        self.targets.lock().clone()
    }
}

impl ChunkSenderFactory for RecordingSenderFactory {
    fn create(
        &self,
        target: &NodeDescriptor,
        target_allocation_id: &AllocationId,
    ) -> Arc<dyn FileChunkSender> {
        self.targets
            .lock()
            .push((target.id, target_allocation_id.clone()));
        self.sender.clone()
    }
}

/// Replica-side handler storing pushed chunks by file and position.
#[derive(Debug, Default)]
pub struct ReplicaChunkStore {
    files: Mutex<HashMap<String, BTreeMap<u64, Bytes>>>,
    corrupt: AtomicUsize,
}

impl ReplicaChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents of `file` reassembled from its chunks.
    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .get(name)
            .map(|chunks| chunks.values().flat_map(|b| b.to_vec()).collect())
    }

    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.files.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Chunks rejected for a checksum mismatch.
    pub fn corrupt_chunks(&self) -> usize {
        self.corrupt.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl MessageHandler for ReplicaChunkStore {
    async fn handle(&self, msg: Message) -> Option<Message> {
        match msg {
            Message::FileChunk(request) => {
                if !request.chunk.verify() {
                    self.corrupt.fetch_add(1, Ordering::SeqCst);
                    return Some(Message::error(
                        request.request_id,
                        &Error::Internal("chunk checksum mismatch".to_string()),
                    ));
                }
                self.files
                    .lock()
                    .entry(request.chunk.file.name.clone())
                    .or_default()
                    .insert(request.chunk.position, request.chunk.content);
                Some(Message::FileChunkAck(FileChunkResponse {
                    request_id: request.request_id,
                }))
            }
            other => Some(Message::error(
                other.request_id(),
                &Error::Internal(format!("replica cannot handle {}", other.kind())),
            )),
        }
    }
}
