//! Reference-counted message bodies with exactly-once release.
//!
//! A [`ManagedBuffer`] owns a view onto request or response bytes together
//! with an optional release hook. The hook runs exactly once: either when the
//! buffer is explicitly [`release`](ManagedBuffer::release)d or, failing that,
//! when it is dropped. Dispatch code releases bodies explicitly once a
//! collaborator returns; the drop path covers early returns and panics.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};

use bytes::Bytes;

type ReleaseHook = Box<dyn FnOnce() + Send + Sync + 'static>;

/// Byte container backing a message body.
pub struct ManagedBuffer {
    data: Bytes,
    on_release: Option<ReleaseHook>,
}

impl ManagedBuffer {
    /// Wrap `data` without any release bookkeeping.
    #[must_use]
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            on_release: None,
        }
    }

    /// Wrap `data` and run `on_release` when the buffer is released.
    ///
    /// ```
    /// use std::sync::{
    ///     Arc,
    ///     atomic::{AtomicBool, Ordering},
    /// };
    ///
    /// use bytes::Bytes;
    /// use shuffle_transport::buffer::ManagedBuffer;
    ///
    /// let released = Arc::new(AtomicBool::new(false));
    /// let flag = Arc::clone(&released);
    /// let buf = ManagedBuffer::with_release_hook(Bytes::from_static(b"abc"), move || {
    ///     flag.store(true, Ordering::SeqCst);
    /// });
    /// assert_eq!(buf.size(), 3);
    /// buf.release();
    /// assert!(released.load(Ordering::SeqCst));
    /// ```
    #[must_use]
    pub fn with_release_hook(
        data: Bytes,
        on_release: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            data,
            on_release: Some(Box::new(on_release)),
        }
    }

    /// An empty buffer.
    #[must_use]
    pub fn empty() -> Self { Self::new(Bytes::new()) }

    /// Number of bytes in the buffer.
    #[must_use]
    pub fn size(&self) -> usize { self.data.len() }

    /// Whether the buffer holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.data.is_empty() }

    /// A cheap clone of the underlying byte view.
    ///
    /// The view stays valid after release, but collaborators handed a view
    /// during dispatch must not rely on the buffer's lifetime beyond the call.
    #[must_use]
    pub fn bytes(&self) -> Bytes { self.data.clone() }

    /// Borrow the contents.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] { &self.data }

    /// Release the buffer, running its hook.
    pub fn release(mut self) { self.run_release(); }

    fn run_release(&mut self) {
        if let Some(hook) = self.on_release.take() {
            hook();
        }
    }
}

impl Drop for ManagedBuffer {
    fn drop(&mut self) { self.run_release(); }
}

impl fmt::Debug for ManagedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedBuffer")
            .field("size", &self.data.len())
            .field("tracked", &self.on_release.is_some())
            .finish()
    }
}

impl Default for ManagedBuffer {
    fn default() -> Self { Self::empty() }
}

impl From<Bytes> for ManagedBuffer {
    fn from(data: Bytes) -> Self { Self::new(data) }
}

impl From<Vec<u8>> for ManagedBuffer {
    fn from(data: Vec<u8>) -> Self { Self::new(Bytes::from(data)) }
}

impl From<&'static [u8]> for ManagedBuffer {
    fn from(data: &'static [u8]) -> Self { Self::new(Bytes::from_static(data)) }
}

/// Counts buffers that have been handed out but not yet released.
///
/// Cloning the tracker shares the count.
#[derive(Clone, Debug, Default)]
pub struct BufferTracker {
    outstanding: Arc<AtomicI64>,
}

impl BufferTracker {
    /// Create a tracker with no outstanding buffers.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Wrap `data` in a buffer counted by this tracker.
    #[must_use]
    pub fn track(&self, data: impl Into<Bytes>) -> ManagedBuffer {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let outstanding = Arc::clone(&self.outstanding);
        ManagedBuffer::with_release_hook(data.into(), move || {
            outstanding.fetch_sub(1, Ordering::SeqCst);
        })
    }

    /// Buffers created by [`track`](Self::track) and not yet released.
    #[must_use]
    pub fn outstanding(&self) -> i64 { self.outstanding.load(Ordering::SeqCst) }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;

    #[fixture]
    fn tracker() -> BufferTracker { BufferTracker::new() }

    #[rstest]
    fn explicit_release_runs_hook_once(tracker: BufferTracker) {
        let buf = tracker.track(Bytes::from_static(b"payload"));
        assert_eq!(tracker.outstanding(), 1);
        buf.release();
        assert_eq!(tracker.outstanding(), 0);
    }

    #[rstest]
    fn drop_releases_unreleased_buffer(tracker: BufferTracker) {
        {
            let _buf = tracker.track(vec![1_u8, 2, 3]);
            assert_eq!(tracker.outstanding(), 1);
        }
        assert_eq!(tracker.outstanding(), 0);
    }

    #[rstest]
    fn bytes_view_survives_release(tracker: BufferTracker) {
        let buf = tracker.track(Bytes::from_static(b"keep"));
        let view = buf.bytes();
        buf.release();
        assert_eq!(&view[..], b"keep");
        assert_eq!(tracker.outstanding(), 0);
    }

    #[rstest]
    fn untracked_buffers_report_size() {
        let buf = ManagedBuffer::from(&b"hello"[..]);
        assert_eq!(buf.size(), 5);
        assert!(!buf.is_empty());
        assert!(ManagedBuffer::empty().is_empty());
    }
}
