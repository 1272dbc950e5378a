//! Transport configuration.
//!
//! [`TransportConf`] gathers the knobs a server needs: the in-flight transfer
//! bound enforced by the dispatcher, the frame size limit enforced by the
//! codec and the accept-loop back-off.

use crate::{
    codec::{DEFAULT_MAX_FRAME_LENGTH, clamp_frame_length},
    server::BackoffConfig,
};

/// Settings shared by every connection of a transport server.
///
/// ```
/// use shuffle_transport::config::TransportConf;
///
/// let conf = TransportConf::default()
///     .with_max_chunks_being_transferred(512)
///     .with_max_frame_length(1);
/// assert_eq!(conf.max_chunks_being_transferred, 512);
/// assert_eq!(conf.max_frame_length(), shuffle_transport::codec::MIN_FRAME_LENGTH);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportConf {
    /// Fetches are refused, by closing the connection, once this many chunk
    /// or stream transfers are in flight across the server.
    pub max_chunks_being_transferred: u64,
    /// Largest accepted frame in bytes, before clamping.
    pub max_frame_length: usize,
    /// Accept-loop retry timing.
    pub backoff: BackoffConfig,
}

impl Default for TransportConf {
    fn default() -> Self {
        Self {
            max_chunks_being_transferred: u64::MAX,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            backoff: BackoffConfig::default(),
        }
    }
}

impl TransportConf {
    /// Set the in-flight transfer bound.
    #[must_use]
    pub fn with_max_chunks_being_transferred(mut self, max: u64) -> Self {
        self.max_chunks_being_transferred = max;
        self
    }

    /// Set the frame size limit.
    #[must_use]
    pub fn with_max_frame_length(mut self, len: usize) -> Self {
        self.max_frame_length = len;
        self
    }

    /// Set the accept-loop back-off.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Frame size limit after clamping to the codec's supported range.
    #[must_use]
    pub fn max_frame_length(&self) -> usize { clamp_frame_length(self.max_frame_length) }
}
