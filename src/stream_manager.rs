//! Chunk and stream providers.
//!
//! A [`StreamManager`] resolves stream identifiers to buffers and tracks how
//! many chunks are in flight so the dispatcher can shed load. One provider is
//! shared by every connection of a server, so its bookkeeping must tolerate
//! concurrent updates.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use log::{debug, trace};

use crate::{
    buffer::ManagedBuffer,
    channel::TransportClient,
    error::{BoxError, TransportError},
    session::ConnectionId,
};

/// Resolves chunk and stream requests to buffers.
pub trait StreamManager: Send + Sync {
    /// Return chunk `chunk_index` of stream `stream_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the chunk cannot be resolved.
    fn get_chunk(&self, stream_id: u64, chunk_index: u32) -> Result<ManagedBuffer, BoxError>;

    /// Open the whole stream named `stream_id`.
    ///
    /// `Ok(None)` means no such stream exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream exists but cannot be opened.
    fn open_stream(&self, _stream_id: &str) -> Result<Option<ManagedBuffer>, BoxError> {
        Err(Box::new(TransportError::Unsupported {
            operation: "open_stream",
        }))
    }

    /// Verify that `client` may read `stream_id`.
    ///
    /// # Errors
    ///
    /// Returns an error describing the denial.
    fn check_authorization(
        &self,
        _client: &TransportClient,
        _stream_id: u64,
    ) -> Result<(), BoxError> {
        Ok(())
    }

    /// Number of chunks and streams currently being written to clients.
    fn chunks_being_transferred(&self) -> u64 { 0 }

    /// A chunk of `stream_id` is about to be written.
    fn chunk_being_sent(&self, _stream_id: u64) {}

    /// A chunk write for `stream_id` finished, successfully or not.
    fn chunk_sent(&self, _stream_id: u64) {}

    /// Stream `stream_id` is about to be written.
    fn stream_being_sent(&self, _stream_id: &str) {}

    /// A stream write finished, successfully or not.
    fn stream_sent(&self, _stream_id: &str) {}

    /// `connection` closed; release any state tied to it.
    ///
    /// # Errors
    ///
    /// Errors are logged by the caller and do not block further cleanup.
    fn connection_terminated(&self, _connection: ConnectionId) -> Result<(), BoxError> { Ok(()) }
}

/// Build the `"<streamId>_<chunkIndex>"` name used to open a single chunk
/// as a stream.
#[must_use]
pub fn gen_stream_chunk_id(stream_id: u64, chunk_index: u32) -> String {
    format!("{stream_id}_{chunk_index}")
}

/// Parse a name produced by [`gen_stream_chunk_id`].
///
/// # Errors
///
/// Returns [`TransportError::InvalidStreamChunkId`] if `name` is malformed.
pub fn parse_stream_chunk_id(name: &str) -> Result<(u64, u32), TransportError> {
    let invalid = || TransportError::InvalidStreamChunkId(name.to_owned());
    let (stream, chunk) = name.split_once('_').ok_or_else(invalid)?;
    let stream_id = stream.parse().map_err(|_| invalid())?;
    let chunk_index = chunk.parse().map_err(|_| invalid())?;
    Ok((stream_id, chunk_index))
}

struct StreamState {
    app_id: Option<String>,
    buffers: VecDeque<ManagedBuffer>,
    total_chunks: u32,
    cur_chunk: u32,
    connection: Option<ConnectionId>,
}

/// Serves registered streams chunk by chunk, strictly in order.
///
/// Each registered stream is a fixed list of buffers fetched one at a time by
/// a single reader. A stream is dropped after its last chunk is handed out or
/// when the connection it was registered for terminates.
///
/// The in-flight count is kept apart from the streams, so a chunk still being
/// written counts after its stream has been dropped.
#[derive(Default)]
pub struct OneForOneStreamManager {
    next_stream_id: AtomicU64,
    streams: DashMap<u64, StreamState>,
    in_flight: AtomicU64,
}

impl OneForOneStreamManager {
    /// Create a manager with no streams.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Create a manager whose stream ids start at `first_stream_id`.
    ///
    /// Servers that restart may seed this to avoid reusing ids clients still
    /// hold.
    #[must_use]
    pub fn with_first_stream_id(first_stream_id: u64) -> Self {
        Self {
            next_stream_id: AtomicU64::new(first_stream_id),
            streams: DashMap::new(),
            in_flight: AtomicU64::new(0),
        }
    }

    /// Register `buffers` as a new stream and return its id.
    ///
    /// `app_id`, when set, restricts reads to clients presenting that id.
    /// `connection`, when set, ties the stream's lifetime to that connection.
    pub fn register_stream(
        &self,
        app_id: Option<String>,
        buffers: Vec<ManagedBuffer>,
        connection: Option<ConnectionId>,
    ) -> u64 {
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let total_chunks = u32::try_from(buffers.len()).unwrap_or(u32::MAX);
        debug!(
            "registered stream: stream_id={stream_id}, chunks={total_chunks}, app_id={app_id:?}, \
             connection={connection:?}"
        );
        self.streams.insert(
            stream_id,
            StreamState {
                app_id,
                buffers: buffers.into(),
                total_chunks,
                cur_chunk: 0,
                connection,
            },
        );
        stream_id
    }

    /// Number of streams still registered.
    #[must_use]
    pub fn num_streams(&self) -> usize { self.streams.len() }
}

impl StreamManager for OneForOneStreamManager {
    fn get_chunk(&self, stream_id: u64, chunk_index: u32) -> Result<ManagedBuffer, BoxError> {
        let mut state = self
            .streams
            .get_mut(&stream_id)
            .ok_or(TransportError::UnknownStream { stream_id })?;
        if chunk_index != state.cur_chunk {
            return Err(TransportError::OutOfOrderChunk {
                requested: chunk_index,
                expected: state.cur_chunk,
            }
            .into());
        }
        let end = state.total_chunks;
        let buffer = state
            .buffers
            .pop_front()
            .ok_or(TransportError::ChunkOutOfRange {
                requested: chunk_index,
                end,
            })?;
        state.cur_chunk += 1;
        let exhausted = state.buffers.is_empty();
        drop(state);

        if exhausted {
            trace!("removing fully consumed stream: stream_id={stream_id}");
            self.streams.remove(&stream_id);
        }
        Ok(buffer)
    }

    fn open_stream(&self, stream_id: &str) -> Result<Option<ManagedBuffer>, BoxError> {
        let (stream_id, chunk_index) = parse_stream_chunk_id(stream_id)?;
        self.get_chunk(stream_id, chunk_index).map(Some)
    }

    fn check_authorization(&self, client: &TransportClient, stream_id: u64) -> Result<(), BoxError> {
        let Some(client_id) = client.client_id() else {
            return Ok(());
        };
        let state = self
            .streams
            .get(&stream_id)
            .ok_or(TransportError::UnknownStream { stream_id })?;
        if state.app_id.as_deref() == Some(client_id.as_str()) {
            return Ok(());
        }
        Err(TransportError::Unauthorized {
            client_id,
            stream_id,
            app_id: state.app_id.clone(),
        }
        .into())
    }

    fn chunks_being_transferred(&self) -> u64 { self.in_flight.load(Ordering::SeqCst) }

    fn chunk_being_sent(&self, _stream_id: u64) { self.in_flight.fetch_add(1, Ordering::SeqCst); }

    fn chunk_sent(&self, stream_id: u64) {
        let updated = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if updated.is_err() {
            debug!("chunk sent with nothing in flight: stream_id={stream_id}");
        }
    }

    fn stream_being_sent(&self, _stream_id: &str) { self.in_flight.fetch_add(1, Ordering::SeqCst); }

    fn stream_sent(&self, stream_id: &str) {
        let updated = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if updated.is_err() {
            debug!("stream sent with nothing in flight: stream_id={stream_id}");
        }
    }

    fn connection_terminated(&self, connection: ConnectionId) -> Result<(), BoxError> {
        let before = self.streams.len();
        self.streams
            .retain(|_, state| state.connection != Some(connection));
        let removed = before.saturating_sub(self.streams.len());
        if removed > 0 {
            debug!("released streams of closed connection: connection={connection}, streams={removed}");
        }
        Ok(())
    }
}
