//! Network communication layer.

pub mod client;
pub mod rpc;
pub mod server;

pub use client::RpcClient;
pub use rpc::{
    CheckpointInfoRequest, CheckpointInfoResponse, ErrorResponse, FileChunkRequest,
    FileChunkResponse, GetSegmentFilesRequest, GetSegmentFilesResponse, Message,
    TrackShardRequest, TrackShardResponse, FILE_CHUNK, GET_CHECKPOINT_INFO, GET_SEGMENT_FILES,
    TRACK_SHARD,
};
pub use server::{HandlerRegistry, MessageHandler, NetworkServer};
