//! Contracts implemented by the business layer behind a transport server.
//!
//! [`RpcHandler`] receives generic RPCs, one-way messages, uploads and
//! shuffle pushes, and supplies the [`StreamManager`] that serves fetches.
//! Handlers are invoked synchronously from the connection's dispatch loop and
//! answer through the callback they are given, which may be completed later
//! from any thread.

use std::sync::Arc;

use bytes::Bytes;
use log::warn;

use crate::{
    channel::TransportClient,
    error::{BoxError, SharedError, TransportError, error_detail},
    protocol::{PushData, PushMergedData},
    stream_manager::StreamManager,
};

/// Two-outcome completion for a request that expects a reply.
pub trait RpcResponseCallback: Send + Sync {
    /// Reply with `response`.
    fn on_success(&self, response: Bytes);

    /// Reply with a failure.
    fn on_failure(&self, error: SharedError);
}

/// Consumer of a streamed body.
pub trait StreamCallback: Send {
    /// A slice of the body arrived.
    ///
    /// # Errors
    ///
    /// An error aborts the stream and fails the connection.
    fn on_data(&mut self, stream_id: &str, buf: Bytes) -> Result<(), BoxError>;

    /// The last byte of the body arrived.
    ///
    /// # Errors
    ///
    /// Returns the consumer's post-processing error.
    fn on_complete(&mut self, stream_id: &str) -> Result<(), BoxError>;

    /// The stream failed before completing.
    ///
    /// # Errors
    ///
    /// Errors are logged by the caller and otherwise ignored.
    fn on_failure(&mut self, stream_id: &str, cause: SharedError) -> Result<(), BoxError>;
}

/// Upload consumer that also names the stream it receives.
pub trait StreamCallbackWithId: StreamCallback {
    /// Identifier of the upload.
    fn id(&self) -> String;
}

/// Callback used for one-way messages routed through [`RpcHandler::receive`].
///
/// One-way messages have no reply, so results are only logged.
#[derive(Clone, Copy, Debug, Default)]
pub struct OneWayRpcCallback;

impl RpcResponseCallback for OneWayRpcCallback {
    fn on_success(&self, _response: Bytes) {
        warn!("response provided for one-way rpc; dropping it");
    }

    fn on_failure(&self, error: SharedError) {
        warn!(
            "error response provided for one-way rpc: error={}",
            error_detail(&*error)
        );
    }
}

/// Business logic behind a transport server.
///
/// Only [`receive`](Self::receive) and
/// [`stream_manager`](Self::stream_manager) are required; the remaining
/// operations default to rejecting the request.
pub trait RpcHandler: Send + Sync + 'static {
    /// Handle a generic RPC and reply through `callback`.
    ///
    /// `message` must not be retained beyond the call.
    ///
    /// # Errors
    ///
    /// A returned error is sent back as an RPC failure.
    fn receive(
        &self,
        client: &TransportClient,
        message: Bytes,
        callback: Arc<dyn RpcResponseCallback>,
    ) -> Result<(), BoxError>;

    /// Handle a one-way message.
    ///
    /// # Errors
    ///
    /// A returned error is logged; one-way messages have no reply.
    fn receive_one_way(&self, client: &TransportClient, message: Bytes) -> Result<(), BoxError> {
        self.receive(client, message, Arc::new(OneWayRpcCallback))
    }

    /// Accept an upload described by `meta` and return its consumer.
    ///
    /// Returning `Ok(None)` is treated as a failure to accept the upload.
    ///
    /// # Errors
    ///
    /// A returned error fails the RPC and closes the connection.
    fn receive_stream(
        &self,
        _client: &TransportClient,
        _meta: Bytes,
        _callback: Arc<dyn RpcResponseCallback>,
    ) -> Result<Option<Box<dyn StreamCallbackWithId>>, BoxError> {
        Err(Box::new(TransportError::Unsupported {
            operation: "receive_stream",
        }))
    }

    /// Ingest shuffle data for a single partition.
    ///
    /// # Errors
    ///
    /// A returned error is sent back as an RPC failure.
    fn receive_push_data(
        &self,
        _client: &TransportClient,
        _request: &PushData,
        _callback: Arc<dyn RpcResponseCallback>,
    ) -> Result<(), BoxError> {
        Err(Box::new(TransportError::Unsupported {
            operation: "receive_push_data",
        }))
    }

    /// Ingest batched shuffle data for several partitions.
    ///
    /// # Errors
    ///
    /// A returned error is sent back as an RPC failure.
    fn receive_push_merged_data(
        &self,
        _client: &TransportClient,
        _request: &PushMergedData,
        _callback: Arc<dyn RpcResponseCallback>,
    ) -> Result<(), BoxError> {
        Err(Box::new(TransportError::Unsupported {
            operation: "receive_push_merged_data",
        }))
    }

    /// The provider serving chunk and stream fetches.
    fn stream_manager(&self) -> Arc<dyn StreamManager>;

    /// Whether this worker may serve gated requests.
    fn check_registered(&self) -> bool { true }

    /// A connection became active.
    fn channel_active(&self, _client: &TransportClient) {}

    /// A connection closed.
    fn channel_inactive(&self, _client: &TransportClient) {}

    /// A connection failed.
    fn exception_caught(&self, _cause: &SharedError, _client: &TransportClient) {}
}
