//! Per-connection request dispatch.
//!
//! [`RequestDispatcher`] receives decoded [`RequestMessage`]s in arrival
//! order, gates them on worker registration and on the global in-flight
//! transfer limit, invokes the [`RpcHandler`] or [`StreamManager`], and
//! answers through a [`ResponseWriter`]. Collaborator failures, including
//! panics, become failure responses; only a failed upload acceptance escapes
//! [`handle`](RequestDispatcher::handle), so the connection can be torn down.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use log::{debug, error, trace, warn};

use crate::{
    buffer::ManagedBuffer,
    channel::{Channel, TransportClient},
    error::{BoxError, SharedError, TransportError, error_detail},
    handler::{RpcHandler, RpcResponseCallback, StreamCallback, StreamCallbackWithId},
    interceptor::StreamInterceptor,
    panic::{guard, guard_infallible},
    protocol::{
        ChunkFetchRequest,
        OneWayMessage,
        PushData,
        PushMergedData,
        RequestMessage,
        ResponseMessage,
        RpcRequest,
        StreamRequest,
        UploadStream,
    },
    response::ResponseWriter,
    stream_manager::StreamManager,
};

/// How a failure reported through an RPC callback is rendered on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FailureText {
    /// Display text plus the `caused by:` chain.
    Detail,
    /// Display text only.
    Raw,
}

/// Replies to one request id, at most once.
struct RpcReply {
    writer: ResponseWriter,
    request_id: u64,
    failure_text: FailureText,
    /// Request context logged with failures reported through the callback.
    log_context: Option<String>,
    replied: AtomicBool,
}

impl RpcReply {
    fn new(writer: ResponseWriter, request_id: u64, failure_text: FailureText) -> Arc<Self> {
        Arc::new(Self {
            writer,
            request_id,
            failure_text,
            log_context: None,
            replied: AtomicBool::new(false),
        })
    }

    /// Reply to a push, logging callback failures under `context`.
    fn for_push(writer: ResponseWriter, request_id: u64, context: String) -> Arc<Self> {
        Arc::new(Self {
            writer,
            request_id,
            failure_text: FailureText::Raw,
            log_context: Some(context),
            replied: AtomicBool::new(false),
        })
    }

    fn claim(&self, outcome: &str) -> bool {
        let first = !self.replied.swap(true, Ordering::SeqCst);
        if !first {
            debug!(
                "dropping duplicate reply: request_id={}, outcome={outcome}",
                self.request_id
            );
        }
        first
    }

    fn fail_with(&self, error: String) {
        if self.claim("failure") {
            self.writer.respond(ResponseMessage::RpcFailure {
                request_id: self.request_id,
                error,
            });
        }
    }
}

impl RpcResponseCallback for RpcReply {
    fn on_success(&self, response: Bytes) {
        if self.claim("success") {
            self.writer.respond(ResponseMessage::RpcResponse {
                request_id: self.request_id,
                body: ManagedBuffer::new(response),
            });
        }
    }

    fn on_failure(&self, error: SharedError) {
        let text = match self.failure_text {
            FailureText::Detail => error_detail(&*error),
            FailureText::Raw => error.to_string(),
        };
        if let Some(context) = &self.log_context {
            error!("{context}, error={}", error_detail(&*error));
        }
        self.fail_with(text);
    }
}

/// Adapts an upload consumer so that completion and failure also answer the
/// upload's RPC.
struct UploadStreamCallback {
    consumer: Box<dyn StreamCallbackWithId>,
    reply: Arc<RpcReply>,
}

impl StreamCallback for UploadStreamCallback {
    fn on_data(&mut self, stream_id: &str, buf: Bytes) -> Result<(), BoxError> {
        guard(|| self.consumer.on_data(stream_id, buf))
    }

    fn on_complete(&mut self, stream_id: &str) -> Result<(), BoxError> {
        match guard(|| self.consumer.on_complete(stream_id)) {
            Ok(()) => self.reply.on_success(Bytes::new()),
            Err(source) => {
                let err = TransportError::UploadPostProcessing { source }.shared();
                warn!(
                    "upload post-processing failed; connection stays open: stream_id={stream_id}, \
                     request_id={}, error={}",
                    self.reply.request_id,
                    error_detail(&*err)
                );
                self.reply.on_failure(Arc::clone(&err));
                if let Err(e) = guard(|| self.consumer.on_failure(stream_id, err)) {
                    warn!("upload consumer failed handling its own failure: stream_id={stream_id}, error={e}");
                }
            }
        }
        Ok(())
    }

    fn on_failure(&mut self, stream_id: &str, cause: SharedError) -> Result<(), BoxError> {
        self.reply.on_failure(
            TransportError::UploadDestinationFailed {
                source: Arc::clone(&cause),
            }
            .shared(),
        );
        guard(|| self.consumer.on_failure(stream_id, cause))
    }
}

/// Routes one connection's requests to the business layer.
pub struct RequestDispatcher {
    channel: Channel,
    reverse_client: TransportClient,
    handler: Arc<dyn RpcHandler>,
    stream_manager: Arc<dyn StreamManager>,
    writer: ResponseWriter,
    max_chunks_being_transferred: u64,
}

impl fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("connection", &self.channel.id())
            .field("remote_addr", &self.channel.remote_address())
            .field("max_chunks_being_transferred", &self.max_chunks_being_transferred)
            .finish_non_exhaustive()
    }
}

impl RequestDispatcher {
    /// Create a dispatcher for `channel`.
    ///
    /// Chunk and stream fetches are refused, by closing the connection, while
    /// the stream manager reports `max_chunks_being_transferred` or more
    /// transfers in flight.
    #[must_use]
    pub fn new(
        channel: Channel,
        reverse_client: TransportClient,
        handler: Arc<dyn RpcHandler>,
        max_chunks_being_transferred: u64,
    ) -> Self {
        let stream_manager = handler.stream_manager();
        let writer = ResponseWriter::new(channel.clone());
        Self {
            channel,
            reverse_client,
            handler,
            stream_manager,
            writer,
            max_chunks_being_transferred,
        }
    }

    /// The reverse-direction client handed to collaborators.
    #[must_use]
    pub fn client(&self) -> &TransportClient { &self.reverse_client }

    /// The connection became active.
    pub fn channel_active(&self) {
        if let Err(panic) = guard_infallible(|| self.handler.channel_active(&self.reverse_client)) {
            error!(
                "rpc handler panicked in channel_active: remote_addr={:?}, panic={panic}",
                self.channel.remote_address()
            );
        }
    }

    /// The connection failed.
    pub fn exception_caught(&self, cause: &SharedError) {
        if let Err(panic) =
            guard_infallible(|| self.handler.exception_caught(cause, &self.reverse_client))
        {
            error!(
                "rpc handler panicked in exception_caught: remote_addr={:?}, panic={panic}",
                self.channel.remote_address()
            );
        }
    }

    /// The connection closed.
    ///
    /// The stream manager is told first; its failure is logged and does not
    /// prevent the handler from being notified.
    pub fn channel_inactive(&self) {
        let connection = self.channel.id();
        if let Err(e) = guard(|| self.stream_manager.connection_terminated(connection)) {
            error!(
                "stream manager failed to clean up closed connection: connection={connection}, \
                 remote_addr={:?}, error={}",
                self.channel.remote_address(),
                error_detail(&*e)
            );
        }
        if let Err(panic) = guard_infallible(|| self.handler.channel_inactive(&self.reverse_client))
        {
            error!("rpc handler panicked in channel_inactive: connection={connection}, panic={panic}");
        }
    }

    /// Dispatch one request.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::UploadRejected`] when an upload could not be
    /// accepted, after answering it with an RPC failure. The caller must
    /// treat this as a connection failure: raw body bytes may already be in
    /// flight with no consumer to absorb them.
    pub fn handle(&self, request: RequestMessage) -> Result<(), TransportError> {
        match request {
            RequestMessage::Stream(req) => self.process_stream_request(req),
            RequestMessage::Upload(req) => return self.process_stream_upload(req),
            RequestMessage::ChunkFetch(req) => self.process_fetch_request(req),
            RequestMessage::Rpc(req) => self.process_rpc_request(req),
            RequestMessage::OneWay(msg) => self.process_one_way_message(msg),
            RequestMessage::PushData(req) => self.process_push_data(req),
            RequestMessage::PushMergedData(req) => self.process_push_merged_data(req),
        }
        Ok(())
    }

    fn is_registered(&self) -> bool {
        match guard(|| Ok(self.handler.check_registered())) {
            Ok(registered) => registered,
            Err(e) => {
                error!("registration check failed; treating worker as unregistered: error={e}");
                false
            }
        }
    }

    fn reject_unregistered(&self, request: &str) -> String {
        warn!(
            "rejecting request; worker not registered: request={request}, remote_addr={:?}",
            self.channel.remote_address()
        );
        error_detail(&TransportError::NotRegistered)
    }

    /// Refuse a transfer and close the connection when too many are in
    /// flight.
    fn admit_transfer(&self, what: &dyn fmt::Display) -> bool {
        let in_flight = self.stream_manager.chunks_being_transferred();
        if in_flight < self.max_chunks_being_transferred {
            return true;
        }
        warn!(
            "chunks in flight at limit; closing connection: request={what}, in_flight={in_flight}, \
             max={}, remote_addr={:?}",
            self.max_chunks_being_transferred,
            self.channel.remote_address()
        );
        self.channel.close();
        false
    }

    fn process_fetch_request(&self, req: ChunkFetchRequest) {
        let id = req.stream_chunk_id;
        trace!(
            "received chunk fetch request: stream_chunk_id={id}, remote_addr={:?}",
            self.channel.remote_address()
        );
        if !self.is_registered() {
            let error = self.reject_unregistered(&id.to_string());
            self.writer.respond(ResponseMessage::ChunkFetchFailure {
                stream_chunk_id: id,
                error,
            });
            return;
        }
        if !self.admit_transfer(&id) {
            return;
        }

        let chunk = guard(|| {
            self.stream_manager
                .check_authorization(&self.reverse_client, id.stream_id)?;
            self.stream_manager.get_chunk(id.stream_id, id.chunk_index)
        });
        match chunk {
            Ok(body) => {
                self.stream_manager.chunk_being_sent(id.stream_id);
                let stream_manager = Arc::clone(&self.stream_manager);
                self.writer.respond_then(
                    ResponseMessage::ChunkFetchSuccess {
                        stream_chunk_id: id,
                        body,
                    },
                    move |_| stream_manager.chunk_sent(id.stream_id),
                );
            }
            Err(e) => {
                let error = error_detail(&*e);
                error!(
                    "error opening chunk: stream_chunk_id={id}, remote_addr={:?}, error={error}",
                    self.channel.remote_address()
                );
                self.writer.respond(ResponseMessage::ChunkFetchFailure {
                    stream_chunk_id: id,
                    error,
                });
            }
        }
    }

    fn process_stream_request(&self, req: StreamRequest) {
        let StreamRequest { stream_id } = req;
        trace!(
            "received stream request: stream_id={stream_id}, remote_addr={:?}",
            self.channel.remote_address()
        );
        if !self.admit_transfer(&stream_id) {
            return;
        }

        match guard(|| self.stream_manager.open_stream(&stream_id)) {
            Ok(Some(body)) => {
                self.stream_manager.stream_being_sent(&stream_id);
                let stream_manager = Arc::clone(&self.stream_manager);
                let sent_id = stream_id.clone();
                self.writer.respond_then(
                    ResponseMessage::StreamResponse {
                        stream_id,
                        byte_count: body.size() as u64,
                        body,
                    },
                    move |_| stream_manager.stream_sent(&sent_id),
                );
            }
            Ok(None) => {
                let error = TransportError::StreamNotFound {
                    stream_id: stream_id.clone(),
                }
                .to_string();
                self.writer
                    .respond(ResponseMessage::StreamFailure { stream_id, error });
            }
            Err(e) => {
                let error = error_detail(&*e);
                error!(
                    "error opening stream: stream_id={stream_id}, remote_addr={:?}, error={error}",
                    self.channel.remote_address()
                );
                self.writer
                    .respond(ResponseMessage::StreamFailure { stream_id, error });
            }
        }
    }

    fn process_rpc_request(&self, req: RpcRequest) {
        let RpcRequest { request_id, body } = req;
        if !self.is_registered() {
            let error = self.reject_unregistered(&format!("rpc {request_id}"));
            self.writer
                .respond(ResponseMessage::RpcFailure { request_id, error });
            body.release();
            return;
        }

        let reply = RpcReply::new(self.writer.clone(), request_id, FailureText::Detail);
        let callback: Arc<dyn RpcResponseCallback> = reply.clone();
        if let Err(e) = guard(|| self.handler.receive(&self.reverse_client, body.bytes(), callback))
        {
            let error = error_detail(&*e);
            error!(
                "rpc handler failed: request_id={request_id}, remote_addr={:?}, error={error}",
                self.channel.remote_address()
            );
            reply.fail_with(error);
        }
        body.release();
    }

    fn process_one_way_message(&self, msg: OneWayMessage) {
        let OneWayMessage { body } = msg;
        if !self.is_registered() {
            self.reject_unregistered("one-way message");
            body.release();
            return;
        }

        if let Err(e) = guard(|| self.handler.receive_one_way(&self.reverse_client, body.bytes())) {
            error!(
                "rpc handler failed on one-way message: remote_addr={:?}, error={}",
                self.channel.remote_address(),
                error_detail(&*e)
            );
        }
        body.release();
    }

    fn process_stream_upload(&self, req: UploadStream) -> Result<(), TransportError> {
        let UploadStream {
            request_id,
            meta,
            body_byte_count,
        } = req;
        let reply = RpcReply::new(self.writer.clone(), request_id, FailureText::Detail);
        let callback: Arc<dyn RpcResponseCallback> = reply.clone();
        let accepted = guard(|| {
            self.handler
                .receive_stream(&self.reverse_client, meta.bytes(), callback)?
                .ok_or_else(|| TransportError::NullStreamHandler.into())
        });
        meta.release();

        let consumer = match accepted {
            Ok(consumer) => consumer,
            Err(e) => {
                let cause: SharedError = Arc::from(e);
                error!(
                    "failed to accept upload; closing connection: request_id={request_id}, \
                     remote_addr={:?}, error={}",
                    self.channel.remote_address(),
                    error_detail(&*cause)
                );
                reply.on_failure(Arc::clone(&cause));
                return Err(TransportError::UploadRejected {
                    request_id,
                    source: cause,
                });
            }
        };

        let stream_id = consumer.id();
        let mut wrapper = UploadStreamCallback { consumer, reply };
        if body_byte_count == 0 {
            debug!("completing empty upload: stream_id={stream_id}, request_id={request_id}");
            return wrapper
                .on_complete(&stream_id)
                .map_err(|source| TransportError::UploadRejected {
                    request_id,
                    source: Arc::from(source),
                });
        }

        debug!(
            "receiving upload: stream_id={stream_id}, request_id={request_id}, \
             bytes={body_byte_count}"
        );
        let reply = Arc::clone(&wrapper.reply);
        let interceptor = StreamInterceptor::new(stream_id, body_byte_count, wrapper);
        self.channel
            .set_interceptor(Box::new(interceptor))
            .inspect_err(|_| {
                reply.on_failure(TransportError::InterceptorActive.shared());
            })
    }

    fn process_push_data(&self, req: PushData) {
        if !self.is_registered() {
            let error = self.reject_unregistered(&format!("push data {}", req.request_id));
            self.writer.respond(ResponseMessage::RpcFailure {
                request_id: req.request_id,
                error,
            });
            req.body.release();
            return;
        }

        let context = format!(
            "push data failed: request_id={}, shuffle_key={}, partition_unique_id={}, \
             remote_addr={:?}",
            req.request_id,
            req.shuffle_key,
            req.partition_unique_id,
            self.channel.remote_address()
        );
        let reply = RpcReply::for_push(self.writer.clone(), req.request_id, context.clone());
        let callback: Arc<dyn RpcResponseCallback> = reply.clone();
        if let Err(e) =
            guard(|| self.handler.receive_push_data(&self.reverse_client, &req, callback))
        {
            let error = error_detail(&*e);
            error!("{context}, error={error}");
            reply.fail_with(error);
        }
        req.body.release();
    }

    fn process_push_merged_data(&self, req: PushMergedData) {
        if !self.is_registered() {
            let error = self.reject_unregistered(&format!("push merged data {}", req.request_id));
            self.writer.respond(ResponseMessage::RpcFailure {
                request_id: req.request_id,
                error,
            });
            req.body.release();
            return;
        }

        let context = format!(
            "push merged data failed: request_id={}, shuffle_key={}, partition_unique_ids={:?}, \
             remote_addr={:?}",
            req.request_id,
            req.shuffle_key,
            req.partition_unique_ids,
            self.channel.remote_address()
        );
        let reply = RpcReply::for_push(self.writer.clone(), req.request_id, context.clone());
        let callback: Arc<dyn RpcResponseCallback> = reply.clone();
        if let Err(e) = guard(|| {
            self.handler
                .receive_push_merged_data(&self.reverse_client, &req, callback)
        }) {
            let error = error_detail(&*e);
            error!("{context}, error={error}");
            reply.fail_with(error);
        }
        req.body.release();
    }
}
