//! Error types for the framing layer.
//!
//! [`FramingError`] covers frame-boundary problems detected before the
//! header is read; [`CodecError`] wraps those together with header
//! (de)serialisation failures, interceptor failures and I/O.

use std::io;

use bincode::error::{DecodeError, EncodeError};
use thiserror::Error;

use crate::error::BoxError;

/// Frame-boundary errors raised while splitting the byte stream.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// Frame length prefix indicates size exceeding configured maximum.
    #[error("frame exceeds max length: {size} > {max}")]
    OversizedFrame {
        /// Actual frame size indicated by the length prefix.
        size: usize,
        /// Maximum allowed frame size.
        max: usize,
    },

    /// A frame carried no message type tag.
    #[error("empty frame not permitted")]
    EmptyFrame,

    /// The connection closed part-way through a frame.
    #[error("connection closed mid-frame: received {bytes_received} bytes")]
    Truncated {
        /// Bytes buffered for the incomplete frame.
        bytes_received: usize,
    },
}

/// Top-level error produced by [`TransportCodec`](super::TransportCodec).
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame-boundary violation.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// The message type tag is not recognised.
    #[error("unknown message type {type_id}")]
    UnknownMessageType {
        /// Tag read from the frame.
        type_id: u8,
    },

    /// The frame header could not be decoded.
    #[error("failed to decode frame header: {0}")]
    Decode(#[from] DecodeError),

    /// The frame header could not be encoded.
    #[error("failed to encode frame header: {0}")]
    Encode(#[from] EncodeError),

    /// The installed frame interceptor failed while consuming raw bytes.
    #[error("frame interceptor failed: {0}")]
    Interceptor(#[source] BoxError),

    /// Transport-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// Whether the error came from the installed interceptor's consumer.
    #[must_use]
    pub fn is_interceptor(&self) -> bool { matches!(self, Self::Interceptor(_)) }
}
