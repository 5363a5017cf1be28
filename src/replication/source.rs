//! Replica-side client for a primary's replication handlers.

use super::checkpoint::ReplicationCheckpoint;
use super::tracking::TrackingRegistration;
use crate::error::{NetworkError, Result};
use crate::network::{
    CheckpointInfoRequest, CheckpointInfoResponse, GetSegmentFilesRequest,
    GetSegmentFilesResponse, Message, RpcClient, TrackShardRequest, TrackShardResponse,
};
use crate::types::{AllocationId, NodeDescriptor, ShardId};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default wait for a file request; the primary answers only after the whole push.
const DEFAULT_FILES_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Issues the three replication requests to one primary on behalf of one replica.
#[derive(Debug, Clone)]
pub struct PrimaryReplicationSource {
    client: Arc<RpcClient>,
    primary: NodeDescriptor,
    local_node: NodeDescriptor,
    allocation_id: AllocationId,
    files_timeout: Duration,
}

impl PrimaryReplicationSource {
    pub fn new(
        client: Arc<RpcClient>,
        primary: NodeDescriptor,
        local_node: NodeDescriptor,
        allocation_id: AllocationId,
    ) -> Self {
        Self {
            client,
            primary,
            local_node,
            allocation_id,
            files_timeout: DEFAULT_FILES_TIMEOUT,
        }
    }

    /// Set how long to wait for a file push to finish.
    pub fn with_files_timeout(mut self, timeout: Duration) -> Self {
        self.files_timeout = timeout;
        self
    }

    /// Fetch the manifest for `checkpoint`, pinning it on the primary.
    pub async fn get_checkpoint_metadata(
        &self,
        checkpoint: &ReplicationCheckpoint,
    ) -> Result<CheckpointInfoResponse> {
        let request = Message::GetCheckpointInfo(CheckpointInfoRequest {
            request_id: self.client.next_request_id(),
            checkpoint: checkpoint.clone(),
            target_allocation_id: self.allocation_id.clone(),
            target_node: self.local_node.clone(),
        });

        match self.client.request(self.primary.addr, request).await? {
            Message::CheckpointInfo(response) => Ok(response),
            other => Err(unexpected("CheckpointInfo", &other)),
        }
    }

    /// Ask the primary to push `files_to_fetch` of `checkpoint`; empty means all.
    pub async fn get_segment_files(
        &self,
        checkpoint: &ReplicationCheckpoint,
        files_to_fetch: Vec<String>,
    ) -> Result<GetSegmentFilesResponse> {
        let request = Message::GetSegmentFiles(GetSegmentFilesRequest {
            request_id: self.client.next_request_id(),
            checkpoint: checkpoint.clone(),
            target_allocation_id: self.allocation_id.clone(),
            target_node: self.local_node.clone(),
            files_to_fetch,
        });

        match self
            .client
            .request_with_timeout(self.primary.addr, request, self.files_timeout)
            .await?
        {
            Message::SegmentFiles(response) => {
                debug!(%checkpoint, files = response.files.len(), "Segment files received");
                Ok(response)
            }
            other => Err(unexpected("SegmentFiles", &other)),
        }
    }

    /// Ask the primary to add this replica to the shard's in-sync set.
    pub async fn track_shard(&self, shard_id: &ShardId) -> Result<TrackShardResponse> {
        let request = Message::TrackShard(TrackShardRequest {
            request_id: self.client.next_request_id(),
            registration: TrackingRegistration {
                shard_id: shard_id.clone(),
                target_allocation_id: self.allocation_id.clone(),
                target_node: self.local_node.clone(),
            },
        });

        match self.client.request(self.primary.addr, request).await? {
            Message::TrackShardAck(response) => Ok(response),
            other => Err(unexpected("TrackShardAck", &other)),
        }
    }
}

fn unexpected(expected: &'static str, actual: &Message) -> crate::error::Error {
    NetworkError::UnexpectedResponse {
        expected,
        actual: actual.kind(),
    }
    .into()
}
