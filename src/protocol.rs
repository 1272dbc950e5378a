//! Request and response messages exchanged on a transport connection.
//!
//! Both directions are closed sum types. The dispatcher matches
//! [`RequestMessage`] exhaustively; adding a variant means extending the enum,
//! the codec and the match.

use std::fmt;

use bincode::{Decode, Encode};

use crate::buffer::ManagedBuffer;

/// Identifies one chunk of one stream within a connection's scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Encode, Decode)]
pub struct StreamChunkId {
    /// Stream the chunk belongs to.
    pub stream_id: u64,
    /// Position of the chunk within the stream.
    pub chunk_index: u32,
}

impl StreamChunkId {
    #[must_use]
    pub const fn new(stream_id: u64, chunk_index: u32) -> Self {
        Self {
            stream_id,
            chunk_index,
        }
    }
}

impl fmt::Display for StreamChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StreamChunkId[streamId={},chunkIndex={}]",
            self.stream_id, self.chunk_index
        )
    }
}

/// Request for one chunk of a registered stream.
#[derive(Debug)]
pub struct ChunkFetchRequest {
    pub stream_chunk_id: StreamChunkId,
}

/// Generic RPC expecting exactly one reply.
#[derive(Debug)]
pub struct RpcRequest {
    pub request_id: u64,
    pub body: ManagedBuffer,
}

/// Fire-and-forget message with no reply.
#[derive(Debug)]
pub struct OneWayMessage {
    pub body: ManagedBuffer,
}

/// Request for a whole stream, e.g. a file.
#[derive(Debug)]
pub struct StreamRequest {
    pub stream_id: String,
}

/// Upload announcement; `body_byte_count` raw bytes follow the frame.
#[derive(Debug)]
pub struct UploadStream {
    pub request_id: u64,
    pub meta: ManagedBuffer,
    pub body_byte_count: u64,
}

/// Shuffle data for a single partition.
#[derive(Debug)]
pub struct PushData {
    pub request_id: u64,
    pub shuffle_key: String,
    pub partition_unique_id: String,
    pub body: ManagedBuffer,
}

/// Shuffle data for several partitions of one shuffle, batched in one body.
///
/// `batch_offsets[i]` is where the data for `partition_unique_ids[i]` starts
/// within `body`.
#[derive(Debug)]
pub struct PushMergedData {
    pub request_id: u64,
    pub shuffle_key: String,
    pub partition_unique_ids: Vec<String>,
    pub batch_offsets: Vec<u32>,
    pub body: ManagedBuffer,
}

/// Messages a client sends to the server.
#[derive(Debug)]
pub enum RequestMessage {
    ChunkFetch(ChunkFetchRequest),
    Rpc(RpcRequest),
    OneWay(OneWayMessage),
    Stream(StreamRequest),
    Upload(UploadStream),
    PushData(PushData),
    PushMergedData(PushMergedData),
}

impl RequestMessage {
    /// Wire tag for this message.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::ChunkFetch(_) => MessageType::ChunkFetchRequest,
            Self::Rpc(_) => MessageType::RpcRequest,
            Self::OneWay(_) => MessageType::OneWayMessage,
            Self::Stream(_) => MessageType::StreamRequest,
            Self::Upload(_) => MessageType::UploadStream,
            Self::PushData(_) => MessageType::PushData,
            Self::PushMergedData(_) => MessageType::PushMergedData,
        }
    }
}

/// Messages the server sends back.
#[derive(Debug)]
pub enum ResponseMessage {
    ChunkFetchSuccess {
        stream_chunk_id: StreamChunkId,
        body: ManagedBuffer,
    },
    ChunkFetchFailure {
        stream_chunk_id: StreamChunkId,
        error: String,
    },
    /// `byte_count` raw body bytes follow the frame on the wire.
    StreamResponse {
        stream_id: String,
        byte_count: u64,
        body: ManagedBuffer,
    },
    StreamFailure {
        stream_id: String,
        error: String,
    },
    RpcResponse {
        request_id: u64,
        body: ManagedBuffer,
    },
    RpcFailure {
        request_id: u64,
        error: String,
    },
}

impl ResponseMessage {
    /// Wire tag for this message.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::ChunkFetchSuccess { .. } => MessageType::ChunkFetchSuccess,
            Self::ChunkFetchFailure { .. } => MessageType::ChunkFetchFailure,
            Self::StreamResponse { .. } => MessageType::StreamResponse,
            Self::StreamFailure { .. } => MessageType::StreamFailure,
            Self::RpcResponse { .. } => MessageType::RpcResponse,
            Self::RpcFailure { .. } => MessageType::RpcFailure,
        }
    }

    /// Whether this message reports a failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::ChunkFetchFailure { .. } | Self::StreamFailure { .. } | Self::RpcFailure { .. }
        )
    }
}

impl fmt::Display for ResponseMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChunkFetchSuccess {
                stream_chunk_id,
                body,
            } => write!(f, "ChunkFetchSuccess({stream_chunk_id}, {} bytes)", body.size()),
            Self::ChunkFetchFailure {
                stream_chunk_id, ..
            } => write!(f, "ChunkFetchFailure({stream_chunk_id})"),
            Self::StreamResponse {
                stream_id,
                byte_count,
                ..
            } => write!(f, "StreamResponse({stream_id}, {byte_count} bytes)"),
            Self::StreamFailure { stream_id, .. } => write!(f, "StreamFailure({stream_id})"),
            Self::RpcResponse { request_id, body } => {
                write!(f, "RpcResponse({request_id}, {} bytes)", body.size())
            }
            Self::RpcFailure { request_id, .. } => write!(f, "RpcFailure({request_id})"),
        }
    }
}

/// Either direction of traffic, as produced by the decoder.
#[derive(Debug)]
pub enum Message {
    Request(RequestMessage),
    Response(ResponseMessage),
}

/// One-byte message tags written after the frame length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    ChunkFetchRequest = 0,
    ChunkFetchSuccess = 1,
    ChunkFetchFailure = 2,
    RpcRequest = 3,
    RpcResponse = 4,
    RpcFailure = 5,
    StreamRequest = 6,
    StreamResponse = 7,
    StreamFailure = 8,
    OneWayMessage = 9,
    UploadStream = 10,
    PushData = 11,
    PushMergedData = 12,
}

impl MessageType {
    /// The tag byte.
    #[must_use]
    pub const fn as_u8(self) -> u8 { self as u8 }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            0 => Self::ChunkFetchRequest,
            1 => Self::ChunkFetchSuccess,
            2 => Self::ChunkFetchFailure,
            3 => Self::RpcRequest,
            4 => Self::RpcResponse,
            5 => Self::RpcFailure,
            6 => Self::StreamRequest,
            7 => Self::StreamResponse,
            8 => Self::StreamFailure,
            9 => Self::OneWayMessage,
            10 => Self::UploadStream,
            11 => Self::PushData,
            12 => Self::PushMergedData,
            other => return Err(other),
        })
    }
}
