//! Wire-level client for exercising a transport server.

use std::{io, net::SocketAddr};

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use shuffle_transport::{
    ChunkFetchRequest,
    CodecError,
    FramingError,
    ManagedBuffer,
    Message,
    OneWayMessage,
    PushData,
    PushMergedData,
    RequestMessage,
    ResponseMessage,
    RpcRequest,
    StreamChunkId,
    StreamRequest,
    TransportCodec,
    UploadStream,
    codec::DEFAULT_MAX_FRAME_LENGTH,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tokio_util::codec::Framed;

/// Sends requests and reads responses over one connection.
///
/// Responses arrive in the order the server writes them. Stream response
/// bodies, which follow their frame as raw bytes, are read into the returned
/// message's `body`.
pub struct TestClient<S> {
    framed: Framed<S, TransportCodec>,
}

impl TestClient<TcpStream> {
    /// Connect to `addr`.
    ///
    /// # Errors
    ///
    /// Returns the connection error.
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self::new(TcpStream::connect(addr).await?))
    }
}

impl<S> TestClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Speak the wire format over `stream`.
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, TransportCodec::new(DEFAULT_MAX_FRAME_LENGTH)),
        }
    }

    /// Send one request frame.
    ///
    /// # Errors
    ///
    /// Returns encoding or I/O errors.
    pub async fn send(&mut self, request: RequestMessage) -> Result<(), CodecError> {
        self.framed.send(request).await
    }

    /// Write `bytes` to the connection as they are, bypassing the codec.
    ///
    /// # Errors
    ///
    /// Returns the I/O error.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        let stream = self.framed.get_mut();
        stream.write_all(bytes).await?;
        stream.flush().await
    }

    /// Announce an upload of `body` and stream it after the frame.
    ///
    /// # Errors
    ///
    /// Returns encoding or I/O errors.
    pub async fn upload(
        &mut self,
        request_id: u64,
        meta: &'static [u8],
        body: &[u8],
    ) -> Result<(), CodecError> {
        self.send(RequestMessage::Upload(UploadStream {
            request_id,
            meta: ManagedBuffer::from(meta),
            body_byte_count: body.len() as u64,
        }))
        .await?;
        self.send_raw(body).await?;
        Ok(())
    }

    /// Read the next response, or `None` once the server closed the
    /// connection.
    ///
    /// # Errors
    ///
    /// Returns decoding or I/O errors, including a request arriving from
    /// the server.
    pub async fn recv(&mut self) -> Result<Option<ResponseMessage>, CodecError> {
        let message = match self.framed.next().await {
            None => return Ok(None),
            Some(message) => message?,
        };
        match message {
            Message::Response(ResponseMessage::StreamResponse {
                stream_id,
                byte_count,
                ..
            }) => {
                let body = self.read_body(byte_count).await?;
                Ok(Some(ResponseMessage::StreamResponse {
                    stream_id,
                    byte_count,
                    body: ManagedBuffer::new(body),
                }))
            }
            Message::Response(response) => Ok(Some(response)),
            Message::Request(request) => Err(CodecError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("server sent a request: {:?}", request.message_type()),
            ))),
        }
    }

    /// Read the next response, failing if the connection closed first.
    ///
    /// # Errors
    ///
    /// Returns decoding or I/O errors, or `UnexpectedEof` if the server
    /// closed the connection.
    pub async fn expect_response(&mut self) -> Result<ResponseMessage, CodecError> {
        self.recv().await?.ok_or_else(|| {
            CodecError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before a response arrived",
            ))
        })
    }

    /// Whether the server has closed the connection.
    ///
    /// Consumes any responses still in flight.
    pub async fn is_closed(&mut self) -> bool {
        loop {
            match self.recv().await {
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => return true,
            }
        }
    }

    /// Send an RPC and wait for its reply.
    ///
    /// # Errors
    ///
    /// See [`expect_response`](Self::expect_response).
    pub async fn rpc(&mut self, request_id: u64, body: Bytes) -> Result<ResponseMessage, CodecError> {
        self.send(RequestMessage::Rpc(RpcRequest {
            request_id,
            body: ManagedBuffer::new(body),
        }))
        .await?;
        self.expect_response().await
    }

    /// Send a one-way message.
    ///
    /// # Errors
    ///
    /// Returns encoding or I/O errors.
    pub async fn one_way(&mut self, body: Bytes) -> Result<(), CodecError> {
        self.send(RequestMessage::OneWay(OneWayMessage {
            body: ManagedBuffer::new(body),
        }))
        .await
    }

    /// Request one chunk and wait for the reply.
    ///
    /// # Errors
    ///
    /// See [`expect_response`](Self::expect_response).
    pub async fn fetch_chunk(
        &mut self,
        stream_id: u64,
        chunk_index: u32,
    ) -> Result<ResponseMessage, CodecError> {
        self.send(RequestMessage::ChunkFetch(ChunkFetchRequest {
            stream_chunk_id: StreamChunkId::new(stream_id, chunk_index),
        }))
        .await?;
        self.expect_response().await
    }

    /// Request a whole stream and wait for the reply.
    ///
    /// # Errors
    ///
    /// See [`expect_response`](Self::expect_response).
    pub async fn fetch_stream(&mut self, stream_id: &str) -> Result<ResponseMessage, CodecError> {
        self.send(RequestMessage::Stream(StreamRequest {
            stream_id: stream_id.to_owned(),
        }))
        .await?;
        self.expect_response().await
    }

    /// Push one partition's data and wait for the reply.
    ///
    /// # Errors
    ///
    /// See [`expect_response`](Self::expect_response).
    pub async fn push_data(
        &mut self,
        request_id: u64,
        shuffle_key: &str,
        partition_unique_id: &str,
        body: Bytes,
    ) -> Result<ResponseMessage, CodecError> {
        self.send(RequestMessage::PushData(PushData {
            request_id,
            shuffle_key: shuffle_key.to_owned(),
            partition_unique_id: partition_unique_id.to_owned(),
            body: ManagedBuffer::new(body),
        }))
        .await?;
        self.expect_response().await
    }

    /// Push several partitions' data in one body and wait for the reply.
    ///
    /// # Errors
    ///
    /// See [`expect_response`](Self::expect_response).
    pub async fn push_merged_data(
        &mut self,
        request_id: u64,
        shuffle_key: &str,
        partitions: &[(&str, &[u8])],
    ) -> Result<ResponseMessage, CodecError> {
        let mut body = BytesMut::new();
        let mut batch_offsets = Vec::with_capacity(partitions.len());
        for (_, data) in partitions {
            batch_offsets.push(u32::try_from(body.len()).unwrap_or(u32::MAX));
            body.extend_from_slice(data);
        }
        self.send(RequestMessage::PushMergedData(PushMergedData {
            request_id,
            shuffle_key: shuffle_key.to_owned(),
            partition_unique_ids: partitions.iter().map(|(id, _)| (*id).to_owned()).collect(),
            batch_offsets,
            body: ManagedBuffer::new(body.freeze()),
        }))
        .await?;
        self.expect_response().await
    }

    /// Close the write half of the connection.
    ///
    /// # Errors
    ///
    /// Returns the I/O error.
    pub async fn shutdown(&mut self) -> io::Result<()> { self.framed.get_mut().shutdown().await }

    async fn read_body(&mut self, byte_count: u64) -> Result<Bytes, CodecError> {
        let wanted = usize::try_from(byte_count).map_err(|_| FramingError::OversizedFrame {
            size: usize::MAX,
            max: DEFAULT_MAX_FRAME_LENGTH,
        })?;
        let buffered = self.framed.read_buffer_mut();
        let mut body = buffered.split_to(wanted.min(buffered.len()));
        let remaining = wanted - body.len();
        if remaining > 0 {
            let mut rest = Vec::with_capacity(remaining);
            self.framed
                .get_mut()
                .take(remaining as u64)
                .read_to_end(&mut rest)
                .await?;
            if rest.len() < remaining {
                return Err(FramingError::Truncated {
                    bytes_received: body.len() + rest.len(),
                }
                .into());
            }
            body.extend_from_slice(&rest);
        }
        Ok(body.freeze())
    }
}
