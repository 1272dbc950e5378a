//! Raw-byte interception for streamed message bodies.
//!
//! Some messages announce a body that follows the frame as raw bytes rather
//! than inside it. While such a body is in flight the decoder hands buffered
//! bytes to the connection's [`FrameInterceptor`] instead of parsing frames.
//! The [`InterceptorSlot`] holds at most one interceptor per connection; the
//! decoder clears it once the interceptor reports completion.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::BytesMut;
use log::{debug, warn};

use crate::{
    error::{BoxError, SharedError, TransportError},
    handler::StreamCallback,
};

/// Consumer of raw connection bytes that bypass frame decoding.
pub trait FrameInterceptor: Send {
    /// Consume bytes from `buf`.
    ///
    /// Returns `Ok(true)` while more bytes are expected and `Ok(false)` once
    /// the interceptor is done. Bytes left in `buf` after completion belong to
    /// the next frame.
    ///
    /// # Errors
    ///
    /// Returns the consumer's error; the connection treats it as fatal.
    fn handle(&mut self, buf: &mut BytesMut) -> Result<bool, BoxError>;

    /// The connection failed while the interceptor was installed.
    fn exception_caught(&mut self, cause: SharedError);

    /// The connection closed while the interceptor was installed.
    fn channel_inactive(&mut self);
}

/// Outcome of offering buffered bytes to the slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Feed {
    /// No interceptor is installed; decode frames normally.
    Idle,
    /// The interceptor consumed everything and wants more bytes.
    Pending,
    /// The interceptor finished and was removed.
    Finished,
}

/// Connection-scoped slot holding the active interceptor, if any.
///
/// Cloning shares the slot.
#[derive(Clone, Default)]
pub struct InterceptorSlot {
    inner: Arc<Mutex<Option<Box<dyn FrameInterceptor>>>>,
}

impl InterceptorSlot {
    /// Create an empty slot.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn FrameInterceptor>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install `interceptor`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InterceptorActive`] if another interceptor
    /// is still installed.
    pub fn install(&self, interceptor: Box<dyn FrameInterceptor>) -> Result<(), TransportError> {
        let mut slot = self.lock();
        if slot.is_some() {
            return Err(TransportError::InterceptorActive);
        }
        *slot = Some(interceptor);
        Ok(())
    }

    /// Whether an interceptor is installed.
    #[must_use]
    pub fn is_active(&self) -> bool { self.lock().is_some() }

    /// Offer `buf` to the installed interceptor.
    ///
    /// # Errors
    ///
    /// Propagates the interceptor's error. The interceptor stays installed so
    /// the connection's exception path can notify it.
    pub fn feed(&self, buf: &mut BytesMut) -> Result<Feed, BoxError> {
        let mut slot = self.lock();
        let Some(interceptor) = slot.as_mut() else {
            return Ok(Feed::Idle);
        };
        if buf.is_empty() {
            return Ok(Feed::Pending);
        }
        if interceptor.handle(buf)? {
            Ok(Feed::Pending)
        } else {
            *slot = None;
            Ok(Feed::Finished)
        }
    }

    /// Notify and remove the installed interceptor after a connection error.
    pub fn exception_caught(&self, cause: SharedError) {
        let interceptor = self.lock().take();
        if let Some(mut interceptor) = interceptor {
            interceptor.exception_caught(cause);
        }
    }

    /// Notify and remove the installed interceptor after the connection closed.
    pub fn channel_inactive(&self) {
        let interceptor = self.lock().take();
        if let Some(mut interceptor) = interceptor {
            interceptor.channel_inactive();
        }
    }
}

/// Interceptor that forwards exactly `byte_count` bytes to a [`StreamCallback`].
pub struct StreamInterceptor<C> {
    stream_id: String,
    byte_count: u64,
    bytes_read: u64,
    finished: bool,
    callback: C,
}

impl<C: StreamCallback> StreamInterceptor<C> {
    /// Create an interceptor for `byte_count` bytes of stream `stream_id`.
    ///
    /// `byte_count` must be non-zero; empty bodies complete without
    /// interception.
    pub fn new(stream_id: impl Into<String>, byte_count: u64, callback: C) -> Self {
        debug_assert!(byte_count > 0, "empty streams must not be intercepted");
        Self {
            stream_id: stream_id.into(),
            byte_count,
            bytes_read: 0,
            finished: false,
            callback,
        }
    }

    /// Bytes forwarded so far.
    #[must_use]
    pub fn bytes_read(&self) -> u64 { self.bytes_read }

    fn fail(&mut self, cause: SharedError) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Err(e) = self.callback.on_failure(&self.stream_id, cause) {
            warn!(
                "stream callback failed while handling failure: stream_id={}, error={e}",
                self.stream_id
            );
        }
    }
}

impl<C: StreamCallback> FrameInterceptor for StreamInterceptor<C> {
    fn handle(&mut self, buf: &mut BytesMut) -> Result<bool, BoxError> {
        let remaining = self.byte_count - self.bytes_read;
        let available = u64::try_from(buf.len()).unwrap_or(u64::MAX);
        let to_read = usize::try_from(remaining.min(available)).unwrap_or(buf.len());
        let chunk = buf.split_to(to_read).freeze();
        self.bytes_read += chunk.len() as u64;
        if !chunk.is_empty() {
            self.callback.on_data(&self.stream_id, chunk)?;
        }
        if self.bytes_read < self.byte_count {
            return Ok(true);
        }
        debug!(
            "stream body received: stream_id={}, bytes={}",
            self.stream_id, self.bytes_read
        );
        self.finished = true;
        self.callback.on_complete(&self.stream_id)?;
        Ok(false)
    }

    fn exception_caught(&mut self, cause: SharedError) { self.fail(cause); }

    fn channel_inactive(&mut self) { self.fail(TransportError::ChannelClosed.shared()); }
}
