//! Canonical error types for the transport layer.
//!
//! Collaborators (RPC handlers, stream managers, upload consumers) report
//! failures as [`BoxError`]. Failures that must be delivered to more than one
//! party, such as an upload failure reported both to the client and to the
//! upload consumer, travel as [`SharedError`].

use std::{error::Error as StdError, fmt::Write as _, io, sync::Arc};

use thiserror::Error;

use crate::codec::CodecError;

/// Boxed error returned by transport collaborators.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Reference-counted error that can be handed to several observers.
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

/// Errors raised by the request dispatch layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The business handler reports that this worker is not registered.
    #[error("worker not registered")]
    NotRegistered,
    /// A stream lookup returned no buffer.
    #[error("stream '{stream_id}' was not found")]
    StreamNotFound {
        /// Identifier supplied by the client.
        stream_id: String,
    },
    /// The handler accepted an upload but supplied no consumer for it.
    #[error("rpc handler returned no stream handler")]
    NullStreamHandler,
    /// No consumer could be obtained for an upload; the connection must close.
    #[error("failed to accept upload for request {request_id}")]
    UploadRejected {
        /// Request that announced the upload.
        request_id: u64,
        /// Why the consumer could not be obtained.
        #[source]
        source: SharedError,
    },
    /// A frame interceptor is already installed on the connection.
    #[error("a frame interceptor is already active on this connection")]
    InterceptorActive,
    /// The upload consumer failed while finishing a fully received stream.
    #[error("failure post-processing complete stream; failing this rpc and leaving channel active")]
    UploadPostProcessing {
        /// Error raised by the consumer.
        #[source]
        source: BoxError,
    },
    /// Reading an upload body failed before the declared byte count arrived.
    #[error("destination failed while reading stream")]
    UploadDestinationFailed {
        /// Underlying cause.
        #[source]
        source: SharedError,
    },
    /// The connection closed before an operation could finish.
    #[error("channel closed")]
    ChannelClosed,
    /// A collaborator panicked while handling a request.
    #[error("handler panicked: {message}")]
    HandlerPanicked {
        /// Formatted panic payload.
        message: String,
    },
    /// The collaborator does not implement the requested operation.
    #[error("operation not supported: {operation}")]
    Unsupported {
        /// Name of the operation.
        operation: &'static str,
    },
    /// No stream is registered under the identifier.
    #[error("unknown stream id {stream_id}")]
    UnknownStream {
        /// Requested stream identifier.
        stream_id: u64,
    },
    /// The client may not read the requested stream.
    #[error("client {client_id} not authorized to read stream {stream_id} ({app_id:?})")]
    Unauthorized {
        /// Identifier presented by the client.
        client_id: String,
        /// Requested stream identifier.
        stream_id: u64,
        /// Application that owns the stream.
        app_id: Option<String>,
    },
    /// A chunk was requested out of sequence.
    #[error("received out-of-order chunk index {requested} (expected {expected})")]
    OutOfOrderChunk {
        /// Requested chunk index.
        requested: u32,
        /// Next chunk index the stream will serve.
        expected: u32,
    },
    /// A chunk index fell beyond the registered buffers.
    #[error("requested chunk index {requested} beyond end {end}")]
    ChunkOutOfRange {
        /// Requested chunk index.
        requested: u32,
        /// Number of chunks in the stream.
        end: u32,
    },
    /// A stream chunk identifier string could not be parsed.
    #[error("stream chunk id is invalid: {0}")]
    InvalidStreamChunkId(String),
    /// Framing or header decoding failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Transport-level I/O failure.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Wrap this error for delivery to several observers.
    #[must_use]
    pub fn shared(self) -> SharedError { Arc::new(self) }
}

/// Render an error followed by its chain of sources.
///
/// This is the detailed form sent back for RPC, fetch and upload failures.
/// Push failures send only the top-level message.
///
/// ```
/// use shuffle_transport::error::{TransportError, error_detail};
///
/// let err = TransportError::UploadPostProcessing {
///     source: "disk full".into(),
/// };
/// let detail = error_detail(&err);
/// assert!(detail.starts_with("failure post-processing complete stream"));
/// assert!(detail.ends_with("caused by: disk full"));
/// ```
#[must_use]
pub fn error_detail(error: &(dyn StdError + 'static)) -> String {
    let mut detail = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let _ = write!(detail, "\ncaused by: {cause}");
        source = cause.source();
    }
    detail
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn detail_without_source_is_display_text() {
        let err = TransportError::NotRegistered;
        assert_eq!(error_detail(&err), "worker not registered");
    }

    #[rstest]
    fn detail_walks_nested_sources() {
        let inner = TransportError::UploadPostProcessing {
            source: Box::new(io::Error::other("disk full")),
        };
        let outer = TransportError::UploadDestinationFailed {
            source: inner.shared(),
        };
        let detail = error_detail(&outer);
        let lines: Vec<_> = detail.lines().collect();
        assert_eq!(lines.first(), Some(&"destination failed while reading stream"));
        assert!(lines.iter().any(|l| l.contains("post-processing")));
        assert_eq!(lines.last(), Some(&"caused by: disk full"));
    }

    #[rstest]
    fn stream_not_found_names_stream() {
        let err = TransportError::StreamNotFound {
            stream_id: "missing".into(),
        };
        assert_eq!(err.to_string(), "stream 'missing' was not found");
    }
}
