//! Chunk sender that pushes file chunks to a replica over the transport.

use super::transfer::{ChunkSenderFactory, FileChunk, FileChunkSender};
use crate::error::{NetworkError, Result};
use crate::network::{FileChunkRequest, Message, RpcClient};
use crate::types::{AllocationId, NodeDescriptor};
use std::sync::Arc;
use tracing::trace;

/// Sends each chunk as a [`Message::FileChunk`] request and waits for the ack.
#[derive(Debug)]
pub struct RemoteFileChunkWriter {
    client: Arc<RpcClient>,
    target: NodeDescriptor,
    target_allocation_id: AllocationId,
}

impl RemoteFileChunkWriter {
    pub fn new(
        client: Arc<RpcClient>,
        target: NodeDescriptor,
        target_allocation_id: AllocationId,
    ) -> Self {
        Self {
            client,
            target,
            target_allocation_id,
        }
    }
}

#[async_trait::async_trait]
impl FileChunkSender for RemoteFileChunkWriter {
    async fn send_chunk(&self, chunk: FileChunk) -> Result<()> {
        let request_id = self.client.next_request_id();
        let file = chunk.file.name.clone();
        let position = chunk.position;
        let request = Message::FileChunk(FileChunkRequest {
            request_id,
            target_allocation_id: self.target_allocation_id.clone(),
            chunk,
        });

        match self.client.request(self.target.addr, request).await? {
            Message::FileChunkAck(_) => {
                trace!(target = self.target.id, %file, position, "Chunk acknowledged");
                Ok(())
            }
            other => Err(NetworkError::UnexpectedResponse {
                expected: "FileChunkAck",
                actual: other.kind(),
            }
            .into()),
        }
    }
}

/// Creates [`RemoteFileChunkWriter`]s sharing one client.
#[derive(Debug, Clone)]
pub struct RemoteChunkSenderFactory {
    client: Arc<RpcClient>,
}

impl RemoteChunkSenderFactory {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }
}

impl ChunkSenderFactory for RemoteChunkSenderFactory {
    fn create(
        &self,
        target: &NodeDescriptor,
        target_allocation_id: &AllocationId,
    ) -> Arc<dyn FileChunkSender> {
        Arc::new(RemoteFileChunkWriter::new(
            self.client.clone(),
            target.clone(),
            target_allocation_id.clone(),
        ))
    }
}
