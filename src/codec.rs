//! Wire framing for transport messages.
//!
//! Every message travels as a frame:
//!
//! ```text
//! +-----------------+----------+------------------+-----------------+
//! | length: u32 BE  | type: u8 | bincode header   | in-frame body   |
//! +-----------------+----------+------------------+-----------------+
//!                   |<------------------ length ------------------>|
//! ```
//!
//! [`ResponseMessage::StreamResponse`] and [`RequestMessage::Upload`] carry
//! their bodies outside the frame: the declared number of raw bytes follows
//! immediately and is consumed by the connection's
//! [`FrameInterceptor`](crate::interceptor::FrameInterceptor) rather than the
//! frame decoder.

use bincode::{Decode, Encode, config};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    buffer::ManagedBuffer,
    interceptor::{Feed, InterceptorSlot},
    protocol::{
        ChunkFetchRequest,
        Message,
        MessageType,
        OneWayMessage,
        PushData,
        PushMergedData,
        RequestMessage,
        ResponseMessage,
        RpcRequest,
        StreamChunkId,
        StreamRequest,
        UploadStream,
    },
};

pub mod error;

pub use error::{CodecError, FramingError};

/// Size of the big-endian length prefix.
pub const LENGTH_HEADER_SIZE: usize = 4;

/// Minimum frame length in bytes.
///
/// Configured frame lengths are clamped to at least this value.
pub const MIN_FRAME_LENGTH: usize = 64;

/// Maximum frame length in bytes (64 MiB).
///
/// Configured frame lengths are clamped to at most this value to prevent
/// unbounded memory allocation.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Default frame length (16 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

pub(crate) fn clamp_frame_length(value: usize) -> usize {
    value.clamp(MIN_FRAME_LENGTH, MAX_FRAME_LENGTH)
}

#[derive(Encode, Decode)]
struct RequestIdHeader {
    request_id: u64,
}

#[derive(Encode, Decode)]
struct RpcFailureHeader {
    request_id: u64,
    error: String,
}

#[derive(Encode, Decode)]
struct ChunkFetchFailureHeader {
    stream_chunk_id: StreamChunkId,
    error: String,
}

#[derive(Encode, Decode)]
struct StreamHeader {
    stream_id: String,
}

#[derive(Encode, Decode)]
struct StreamResponseHeader {
    stream_id: String,
    byte_count: u64,
}

#[derive(Encode, Decode)]
struct StreamFailureHeader {
    stream_id: String,
    error: String,
}

#[derive(Encode, Decode)]
struct UploadStreamHeader {
    request_id: u64,
    meta: Vec<u8>,
    body_byte_count: u64,
}

#[derive(Encode, Decode)]
struct PushDataHeader {
    request_id: u64,
    shuffle_key: String,
    partition_unique_id: String,
}

#[derive(Encode, Decode)]
struct PushMergedDataHeader {
    request_id: u64,
    shuffle_key: String,
    partition_unique_ids: Vec<String>,
    batch_offsets: Vec<u32>,
}

/// Length-prefixed codec for both directions of a transport connection.
///
/// The codec shares an [`InterceptorSlot`] with the connection. While an
/// interceptor is installed, buffered bytes go to it instead of the frame
/// decoder.
#[derive(Clone)]
pub struct TransportCodec {
    max_frame_length: usize,
    interceptor: InterceptorSlot,
}

impl TransportCodec {
    /// Create a codec accepting frames of up to `max_frame_length` bytes.
    ///
    /// The value is clamped to
    /// [`MIN_FRAME_LENGTH`]..=[`MAX_FRAME_LENGTH`].
    #[must_use]
    pub fn new(max_frame_length: usize) -> Self {
        Self::with_interceptor(max_frame_length, InterceptorSlot::new())
    }

    /// Create a codec that consults `interceptor` before decoding frames.
    #[must_use]
    pub fn with_interceptor(max_frame_length: usize, interceptor: InterceptorSlot) -> Self {
        Self {
            max_frame_length: clamp_frame_length(max_frame_length),
            interceptor,
        }
    }

    /// Maximum frame length accepted by this codec.
    #[must_use]
    pub fn max_frame_length(&self) -> usize { self.max_frame_length }

    /// The interceptor slot consulted by the decoder.
    #[must_use]
    pub fn interceptor(&self) -> &InterceptorSlot { &self.interceptor }

    fn write_frame<H: Encode>(
        &self,
        ty: MessageType,
        header: &H,
        body: &[u8],
        dst: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let header = bincode::encode_to_vec(header, config::standard())?;
        let len = 1 + header.len() + body.len();
        if len > self.max_frame_length {
            return Err(FramingError::OversizedFrame {
                size: len,
                max: self.max_frame_length,
            }
            .into());
        }
        let prefix = u32::try_from(len).map_err(|_| FramingError::OversizedFrame {
            size: len,
            max: self.max_frame_length,
        })?;
        dst.reserve(LENGTH_HEADER_SIZE + len);
        dst.put_u32(prefix);
        dst.put_u8(ty.as_u8());
        dst.extend_from_slice(&header);
        dst.extend_from_slice(body);
        Ok(())
    }
}

impl Default for TransportCodec {
    fn default() -> Self { Self::new(DEFAULT_MAX_FRAME_LENGTH) }
}

/// Decode a bincode header from the front of `payload`, returning the rest
/// as the in-frame body.
fn split_header<H: Decode<()>>(payload: &Bytes) -> Result<(H, Bytes), CodecError> {
    let (header, used) = bincode::decode_from_slice(payload, config::standard())?;
    Ok((header, payload.slice(used..)))
}

fn decode_frame(frame: Bytes) -> Result<Message, CodecError> {
    let Some(&tag) = frame.first() else {
        return Err(FramingError::EmptyFrame.into());
    };
    let ty = MessageType::try_from(tag)
        .map_err(|type_id| CodecError::UnknownMessageType { type_id })?;
    let payload = frame.slice(1..);

    let message = match ty {
        MessageType::ChunkFetchRequest => {
            let (stream_chunk_id, _) = split_header::<StreamChunkId>(&payload)?;
            Message::Request(RequestMessage::ChunkFetch(ChunkFetchRequest { stream_chunk_id }))
        }
        MessageType::RpcRequest => {
            let (h, body) = split_header::<RequestIdHeader>(&payload)?;
            Message::Request(RequestMessage::Rpc(RpcRequest {
                request_id: h.request_id,
                body: ManagedBuffer::new(body),
            }))
        }
        MessageType::OneWayMessage => Message::Request(RequestMessage::OneWay(OneWayMessage {
            body: ManagedBuffer::new(payload),
        })),
        MessageType::StreamRequest => {
            let (h, _) = split_header::<StreamHeader>(&payload)?;
            Message::Request(RequestMessage::Stream(StreamRequest {
                stream_id: h.stream_id,
            }))
        }
        MessageType::UploadStream => {
            let (h, _) = split_header::<UploadStreamHeader>(&payload)?;
            Message::Request(RequestMessage::Upload(UploadStream {
                request_id: h.request_id,
                meta: ManagedBuffer::from(h.meta),
                body_byte_count: h.body_byte_count,
            }))
        }
        MessageType::PushData => {
            let (h, body) = split_header::<PushDataHeader>(&payload)?;
            Message::Request(RequestMessage::PushData(PushData {
                request_id: h.request_id,
                shuffle_key: h.shuffle_key,
                partition_unique_id: h.partition_unique_id,
                body: ManagedBuffer::new(body),
            }))
        }
        MessageType::PushMergedData => {
            let (h, body) = split_header::<PushMergedDataHeader>(&payload)?;
            Message::Request(RequestMessage::PushMergedData(PushMergedData {
                request_id: h.request_id,
                shuffle_key: h.shuffle_key,
                partition_unique_ids: h.partition_unique_ids,
                batch_offsets: h.batch_offsets,
                body: ManagedBuffer::new(body),
            }))
        }
        MessageType::ChunkFetchSuccess => {
            let (stream_chunk_id, body) = split_header::<StreamChunkId>(&payload)?;
            Message::Response(ResponseMessage::ChunkFetchSuccess {
                stream_chunk_id,
                body: ManagedBuffer::new(body),
            })
        }
        MessageType::ChunkFetchFailure => {
            let (h, _) = split_header::<ChunkFetchFailureHeader>(&payload)?;
            Message::Response(ResponseMessage::ChunkFetchFailure {
                stream_chunk_id: h.stream_chunk_id,
                error: h.error,
            })
        }
        MessageType::RpcResponse => {
            let (h, body) = split_header::<RequestIdHeader>(&payload)?;
            Message::Response(ResponseMessage::RpcResponse {
                request_id: h.request_id,
                body: ManagedBuffer::new(body),
            })
        }
        MessageType::RpcFailure => {
            let (h, _) = split_header::<RpcFailureHeader>(&payload)?;
            Message::Response(ResponseMessage::RpcFailure {
                request_id: h.request_id,
                error: h.error,
            })
        }
        MessageType::StreamResponse => {
            let (h, _) = split_header::<StreamResponseHeader>(&payload)?;
            Message::Response(ResponseMessage::StreamResponse {
                stream_id: h.stream_id,
                byte_count: h.byte_count,
                body: ManagedBuffer::empty(),
            })
        }
        MessageType::StreamFailure => {
            let (h, _) = split_header::<StreamFailureHeader>(&payload)?;
            Message::Response(ResponseMessage::StreamFailure {
                stream_id: h.stream_id,
                error: h.error,
            })
        }
    };
    Ok(message)
}

impl Decoder for TransportCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.interceptor.feed(src).map_err(CodecError::Interceptor)? == Feed::Pending {
            return Ok(None);
        }
        let Some(mut prefix) = src.get(..LENGTH_HEADER_SIZE) else {
            return Ok(None);
        };
        let len = usize::try_from(prefix.get_u32()).unwrap_or(usize::MAX);
        if len > self.max_frame_length {
            return Err(FramingError::OversizedFrame {
                size: len,
                max: self.max_frame_length,
            }
            .into());
        }
        let total = LENGTH_HEADER_SIZE + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_HEADER_SIZE);
        let frame = src.split_to(len).freeze();
        decode_frame(frame).map(Some)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() || self.interceptor.is_active() => Ok(None),
            None => Err(FramingError::Truncated {
                bytes_received: src.len(),
            }
            .into()),
        }
    }
}

impl Encoder<ResponseMessage> for TransportCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ResponseMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            ResponseMessage::ChunkFetchSuccess {
                stream_chunk_id,
                body,
            } => self.write_frame(
                MessageType::ChunkFetchSuccess,
                &stream_chunk_id,
                body.as_slice(),
                dst,
            ),
            ResponseMessage::ChunkFetchFailure {
                stream_chunk_id,
                error,
            } => self.write_frame(
                MessageType::ChunkFetchFailure,
                &ChunkFetchFailureHeader {
                    stream_chunk_id,
                    error,
                },
                &[],
                dst,
            ),
            ResponseMessage::StreamResponse {
                stream_id,
                byte_count,
                body,
            } => {
                self.write_frame(
                    MessageType::StreamResponse,
                    &StreamResponseHeader {
                        stream_id,
                        byte_count,
                    },
                    &[],
                    dst,
                )?;
                dst.extend_from_slice(body.as_slice());
                Ok(())
            }
            ResponseMessage::StreamFailure { stream_id, error } => self.write_frame(
                MessageType::StreamFailure,
                &StreamFailureHeader { stream_id, error },
                &[],
                dst,
            ),
            ResponseMessage::RpcResponse { request_id, body } => self.write_frame(
                MessageType::RpcResponse,
                &RequestIdHeader { request_id },
                body.as_slice(),
                dst,
            ),
            ResponseMessage::RpcFailure { request_id, error } => self.write_frame(
                MessageType::RpcFailure,
                &RpcFailureHeader { request_id, error },
                &[],
                dst,
            ),
        }
    }
}

/// Encodes the frame only; an upload's body must be written separately as
/// `body_byte_count` raw bytes.
impl Encoder<RequestMessage> for TransportCodec {
    type Error = CodecError;

    fn encode(&mut self, item: RequestMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            RequestMessage::ChunkFetch(req) => self.write_frame(
                MessageType::ChunkFetchRequest,
                &req.stream_chunk_id,
                &[],
                dst,
            ),
            RequestMessage::Rpc(req) => self.write_frame(
                MessageType::RpcRequest,
                &RequestIdHeader {
                    request_id: req.request_id,
                },
                req.body.as_slice(),
                dst,
            ),
            RequestMessage::OneWay(msg) => {
                self.write_frame(MessageType::OneWayMessage, &(), msg.body.as_slice(), dst)
            }
            RequestMessage::Stream(req) => self.write_frame(
                MessageType::StreamRequest,
                &StreamHeader {
                    stream_id: req.stream_id,
                },
                &[],
                dst,
            ),
            RequestMessage::Upload(req) => self.write_frame(
                MessageType::UploadStream,
                &UploadStreamHeader {
                    request_id: req.request_id,
                    meta: req.meta.as_slice().to_vec(),
                    body_byte_count: req.body_byte_count,
                },
                &[],
                dst,
            ),
            RequestMessage::PushData(req) => self.write_frame(
                MessageType::PushData,
                &PushDataHeader {
                    request_id: req.request_id,
                    shuffle_key: req.shuffle_key,
                    partition_unique_id: req.partition_unique_id,
                },
                req.body.as_slice(),
                dst,
            ),
            RequestMessage::PushMergedData(req) => self.write_frame(
                MessageType::PushMergedData,
                &PushMergedDataHeader {
                    request_id: req.request_id,
                    shuffle_key: req.shuffle_key,
                    partition_unique_ids: req.partition_unique_ids,
                    batch_offsets: req.batch_offsets,
                },
                req.body.as_slice(),
                dst,
            ),
        }
    }
}

#[cfg(test)]
mod tests;
