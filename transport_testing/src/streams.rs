//! Fixture streams served by a [`FixtureStreams`] provider.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use shuffle_transport::{
    BoxError,
    BufferTracker,
    ManagedBuffer,
    StreamManager,
    TransportError,
};

/// Stream name of a zero-length body.
pub const EMPTY_BUFFER: &str = "emptyBuffer";
/// Stream name of a 100 byte body.
pub const SMALL_BUFFER: &str = "smallBuffer";
/// Stream name of a 100 000 byte body.
pub const LARGE_BUFFER: &str = "largeBuffer";
/// Chunked stream whose chunks are the small and then the large body.
pub const CHUNK_STREAM_ID: u64 = 1;

/// Deterministic contents of the named fixture stream.
#[must_use]
pub fn fixture_bytes(name: &str) -> Option<Bytes> {
    let len = match name {
        EMPTY_BUFFER => 0,
        SMALL_BUFFER => 100,
        LARGE_BUFFER => 100_000,
        _ => return None,
    };
    Some((0..len).map(|i| u8::try_from(i % 251).unwrap_or(0)).collect())
}

/// Provider serving the fixture streams, counting buffers and transfers.
///
/// Every buffer handed out is tracked, so tests can assert all of them were
/// released. The in-flight count starts at the preloaded value and moves
/// with the dispatcher's send bookkeeping.
pub struct FixtureStreams {
    tracker: BufferTracker,
    streams: HashMap<&'static str, Bytes>,
    in_flight: AtomicU64,
    fetches: AtomicU64,
}

impl Default for FixtureStreams {
    fn default() -> Self { Self::new() }
}

impl FixtureStreams {
    /// Serve the fixture streams with nothing in flight.
    #[must_use]
    pub fn new() -> Self {
        let streams = [EMPTY_BUFFER, SMALL_BUFFER, LARGE_BUFFER]
            .into_iter()
            .filter_map(|name| fixture_bytes(name).map(|bytes| (name, bytes)))
            .collect();
        Self {
            tracker: BufferTracker::new(),
            streams,
            in_flight: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
        }
    }

    /// Start with `count` transfers already in flight.
    #[must_use]
    pub fn with_in_flight(self, count: u64) -> Self {
        self.in_flight.store(count, Ordering::SeqCst);
        self
    }

    /// Tracker counting buffers handed out and not yet released.
    #[must_use]
    pub fn tracker(&self) -> &BufferTracker { &self.tracker }

    /// Number of buffers the provider handed out.
    #[must_use]
    pub fn fetches(&self) -> u64 { self.fetches.load(Ordering::SeqCst) }

    fn serve(&self, name: &str) -> Option<ManagedBuffer> {
        let bytes = self.streams.get(name)?.clone();
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Some(self.tracker.track(bytes))
    }
}

impl StreamManager for FixtureStreams {
    fn get_chunk(&self, stream_id: u64, chunk_index: u32) -> Result<ManagedBuffer, BoxError> {
        if stream_id != CHUNK_STREAM_ID {
            return Err(Box::new(TransportError::UnknownStream { stream_id }));
        }
        let name = match chunk_index {
            0 => SMALL_BUFFER,
            1 => LARGE_BUFFER,
            requested => {
                return Err(Box::new(TransportError::ChunkOutOfRange { requested, end: 2 }));
            }
        };
        self.serve(name)
            .ok_or_else(|| Box::new(TransportError::UnknownStream { stream_id }) as BoxError)
    }

    fn open_stream(&self, stream_id: &str) -> Result<Option<ManagedBuffer>, BoxError> {
        Ok(self.serve(stream_id))
    }

    fn chunks_being_transferred(&self) -> u64 { self.in_flight.load(Ordering::SeqCst) }

    fn chunk_being_sent(&self, _stream_id: u64) { self.in_flight.fetch_add(1, Ordering::SeqCst); }

    fn chunk_sent(&self, _stream_id: u64) { self.in_flight.fetch_sub(1, Ordering::SeqCst); }

    fn stream_being_sent(&self, _stream_id: &str) { self.in_flight.fetch_add(1, Ordering::SeqCst); }

    fn stream_sent(&self, _stream_id: &str) { self.in_flight.fetch_sub(1, Ordering::SeqCst); }
}
