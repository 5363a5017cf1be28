//! RPC message types and framing for the replication transport.
//!
//! Every frame is a 4-byte big-endian length followed by a bincode-encoded
//! [`Message`]. Requests carry a `request_id` that the matching response
//! echoes back.

use crate::error::{Error, NetworkError, Result};
use crate::replication::{
    FileChunk, FileMetadata, ReplicationCheckpoint, TrackingRegistration, TransferSummary,
};
use crate::types::{AllocationId, NodeDescriptor};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Action name of checkpoint info requests.
pub const GET_CHECKPOINT_INFO: &str = "internal:index/shard/replication/get_checkpoint_info";
/// Action name of segment file requests.
pub const GET_SEGMENT_FILES: &str = "internal:index/shard/replication/get_segment_files";
/// Action name of track shard requests.
pub const TRACK_SHARD: &str = "internal:index/shard/replication/track_shard";
/// Action name of file chunks pushed from primary to replica.
pub const FILE_CHUNK: &str = "internal:index/shard/replication/file_chunk";

/// Network message wrapper for all communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Replica asks for the manifest of a checkpoint.
    GetCheckpointInfo(CheckpointInfoRequest),

    /// Manifest of a checkpoint.
    CheckpointInfo(CheckpointInfoResponse),

    /// Replica asks the primary to push files of a checkpoint.
    GetSegmentFiles(GetSegmentFilesRequest),

    /// Result of a file push.
    SegmentFiles(GetSegmentFilesResponse),

    /// Replica asks to be added to the in-sync set.
    TrackShard(TrackShardRequest),

    /// Replica is tracked.
    TrackShardAck(TrackShardResponse),

    /// Primary pushes one chunk of a file.
    FileChunk(FileChunkRequest),

    /// Replica stored the chunk.
    FileChunkAck(FileChunkResponse),

    /// A request failed on the remote side.
    Error(ErrorResponse),
}

impl Message {
    /// Action a request is dispatched by. Responses have none.
    pub fn action(&self) -> Option<&'static str> {
        match self {
            Message::GetCheckpointInfo(_) => Some(GET_CHECKPOINT_INFO),
            Message::GetSegmentFiles(_) => Some(GET_SEGMENT_FILES),
            Message::TrackShard(_) => Some(TRACK_SHARD),
            Message::FileChunk(_) => Some(FILE_CHUNK),
            _ => None,
        }
    }

    /// Short name of the variant, for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::GetCheckpointInfo(_) => "GetCheckpointInfo",
            Message::CheckpointInfo(_) => "CheckpointInfo",
            Message::GetSegmentFiles(_) => "GetSegmentFiles",
            Message::SegmentFiles(_) => "SegmentFiles",
            Message::TrackShard(_) => "TrackShard",
            Message::TrackShardAck(_) => "TrackShardAck",
            Message::FileChunk(_) => "FileChunk",
            Message::FileChunkAck(_) => "FileChunkAck",
            Message::Error(_) => "Error",
        }
    }

    pub fn request_id(&self) -> u64 {
        match self {
            Message::GetCheckpointInfo(m) => m.request_id,
            Message::CheckpointInfo(m) => m.request_id,
            Message::GetSegmentFiles(m) => m.request_id,
            Message::SegmentFiles(m) => m.request_id,
            Message::TrackShard(m) => m.request_id,
            Message::TrackShardAck(m) => m.request_id,
            Message::FileChunk(m) => m.request_id,
            Message::FileChunkAck(m) => m.request_id,
            Message::Error(m) => m.request_id,
        }
    }

    /// Error response for a failed request.
    pub fn error(request_id: u64, err: &Error) -> Self {
        Message::Error(ErrorResponse {
            request_id,
            message: err.to_string(),
            retryable: err.is_retryable(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfoRequest {
    pub request_id: u64,
    pub checkpoint: ReplicationCheckpoint,
    pub target_allocation_id: AllocationId,
    pub target_node: NodeDescriptor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfoResponse {
    pub request_id: u64,
    /// Checkpoint of the commit the primary pinned.
    pub checkpoint: ReplicationCheckpoint,
    pub files: Vec<FileMetadata>,
    /// Serialized segment infos of the commit.
    pub manifest: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSegmentFilesRequest {
    pub request_id: u64,
    pub checkpoint: ReplicationCheckpoint,
    pub target_allocation_id: AllocationId,
    pub target_node: NodeDescriptor,
    /// Files the replica is missing. Empty asks for every file.
    pub files_to_fetch: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSegmentFilesResponse {
    pub request_id: u64,
    /// Files pushed to the replica. Empty when the checkpoint was not cached.
    pub files: Vec<FileMetadata>,
    pub summary: Option<TransferSummary>,
}

impl GetSegmentFilesResponse {
    /// Answer for a checkpoint with nothing to send.
    pub fn empty(request_id: u64) -> Self {
        Self {
            request_id,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackShardRequest {
    pub request_id: u64,
    pub registration: TrackingRegistration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackShardResponse {
    pub request_id: u64,
    /// Always true: the primary acks only once the replica is in-sync.
    pub in_sync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunkRequest {
    pub request_id: u64,
    pub target_allocation_id: AllocationId,
    pub chunk: FileChunk,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunkResponse {
    pub request_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub request_id: u64,
    pub message: String,
    pub retryable: bool,
}

impl From<ErrorResponse> for Error {
    fn from(e: ErrorResponse) -> Self {
        Error::RemoteError {
            message: e.message,
            retryable: e.retryable,
        }
    }
}

/// Encode a message to bytes.
pub fn encode_message(msg: &Message) -> std::result::Result<Vec<u8>, bincode::Error> {
    bincode::serialize(msg)
}

/// Decode a message from bytes.
pub fn decode_message(data: &[u8]) -> std::result::Result<Message, bincode::Error> {
    bincode::deserialize(data)
}

/// Frame a message with length prefix for TCP transmission.
pub fn frame_message(msg: &Message) -> std::result::Result<Vec<u8>, bincode::Error> {
    let data = encode_message(msg)?;
    let len = data.len() as u32;

    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&data);

    Ok(framed)
}

/// Write one framed message.
pub async fn write_frame<W>(stream: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = frame_message(msg)?;
    stream
        .write_all(&framed)
        .await
        .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
    Ok(())
}

/// Read one framed message. `None` when the peer closed the connection cleanly.
pub async fn read_frame<R>(stream: &mut R, max_frame_bytes: usize) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::Io(e).into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_bytes {
        return Err(NetworkError::ReceiveFailed(format!(
            "frame of {} bytes exceeds limit of {}",
            len, max_frame_bytes
        ))
        .into());
    }

    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await.map_err(NetworkError::Io)?;
    Ok(Some(decode_message(&data)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_FRAME_BYTES;
    use crate::types::ShardId;

    fn checkpoint() -> ReplicationCheckpoint {
        ReplicationCheckpoint::new(ShardId::new("logs", 0), 1, 5, 12)
    }

    #[test]
    fn test_checkpoint_info_serialization() {
        let msg = Message::CheckpointInfo(CheckpointInfoResponse {
            request_id: 42,
            checkpoint: checkpoint(),
            files: vec![FileMetadata::new("_0.cfs", 10, "abc")],
            manifest: Bytes::from_static(b"segments"),
        });

        let encoded = encode_message(&msg).unwrap();
        let decoded = decode_message(&encoded).unwrap();

        if let Message::CheckpointInfo(resp) = decoded {
            assert_eq!(resp.request_id, 42);
            assert_eq!(resp.checkpoint, checkpoint());
            assert_eq!(resp.files.len(), 1);
            assert_eq!(resp.manifest.as_ref(), b"segments");
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_actions() {
        let request = Message::TrackShard(TrackShardRequest {
            request_id: 1,
            registration: TrackingRegistration {
                shard_id: ShardId::new("logs", 0),
                target_allocation_id: AllocationId::new("a"),
                target_node: NodeDescriptor::new(2, "127.0.0.1:9301".parse().unwrap()),
            },
        });
        assert_eq!(request.action(), Some(TRACK_SHARD));
        assert_eq!(request.kind(), "TrackShard");

        let ack = Message::TrackShardAck(TrackShardResponse {
            request_id: 1,
            in_sync: true,
        });
        assert_eq!(ack.action(), None);
    }

    #[test]
    fn test_error_response_keeps_retryable_flag() {
        let err = Error::Timeout;
        let msg = Message::error(7, &err);
        match msg {
            Message::Error(resp) => {
                assert_eq!(resp.request_id, 7);
                assert!(resp.retryable);
                let back: Error = resp.into();
                assert!(back.is_retryable());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_frame_message() {
        let msg = Message::FileChunkAck(FileChunkResponse { request_id: 3 });
        let framed = frame_message(&msg).unwrap();
        let len = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        assert_eq!(len, framed.len() - 4);
    }

    #[tokio::test]
    async fn test_read_write_frame() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = Message::SegmentFiles(GetSegmentFilesResponse::empty(9));
        write_frame(&mut a, &msg).await.unwrap();
        drop(a);

        let read = read_frame(&mut b, MAX_FRAME_BYTES).await.unwrap().unwrap();
        assert_eq!(read.request_id(), 9);
        assert!(read_frame(&mut b, MAX_FRAME_BYTES).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = Message::SegmentFiles(GetSegmentFilesResponse::empty(9));
        write_frame(&mut a, &msg).await.unwrap();
        assert!(read_frame(&mut b, 4).await.is_err());
    }
}
