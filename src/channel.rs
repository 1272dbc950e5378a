//! Connection handles shared between the dispatcher and its collaborators.
//!
//! A [`Channel`] is the server's view of one connection: it queues outbound
//! responses for the connection's writer task, owns the close signal and the
//! connection's [`InterceptorSlot`]. [`TransportClient`] is the narrower
//! reverse-direction handle passed to business handlers.

use std::{
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};

use log::debug;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    error::TransportError,
    interceptor::{FrameInterceptor, InterceptorSlot},
    protocol::ResponseMessage,
    response::{Outbound, WriteCompletion, WriteListener},
    session::ConnectionId,
};

struct ChannelInner {
    id: ConnectionId,
    remote_addr: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: CancellationToken,
    interceptor: InterceptorSlot,
}

/// Cloneable handle to one connection.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Create a channel and the receiver its writer task drains.
    #[must_use]
    pub fn new(
        id: ConnectionId,
        remote_addr: Option<SocketAddr>,
        interceptor: InterceptorSlot,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = ChannelInner {
            id,
            remote_addr,
            outbound: tx,
            closed: CancellationToken::new(),
            interceptor,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Identifier of the connection.
    #[must_use]
    pub fn id(&self) -> ConnectionId { self.inner.id }

    /// Address of the peer, when known.
    #[must_use]
    pub fn remote_address(&self) -> Option<SocketAddr> { self.inner.remote_addr }

    /// Whether the connection is still open.
    #[must_use]
    pub fn is_active(&self) -> bool { !self.inner.closed.is_cancelled() }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        if !self.inner.closed.is_cancelled() {
            debug!(
                "closing connection: id={}, remote_addr={:?}",
                self.inner.id, self.inner.remote_addr
            );
            self.inner.closed.cancel();
        }
    }

    /// Token cancelled when the connection closes.
    #[must_use]
    pub fn closed_token(&self) -> &CancellationToken { &self.inner.closed }

    /// The connection's interceptor slot.
    #[must_use]
    pub fn interceptor(&self) -> &InterceptorSlot { &self.inner.interceptor }

    /// Route subsequent raw bytes on this connection to `interceptor`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InterceptorActive`] if an interceptor is
    /// already installed.
    pub fn set_interceptor(
        &self,
        interceptor: Box<dyn FrameInterceptor>,
    ) -> Result<(), TransportError> {
        self.inner.interceptor.install(interceptor)
    }

    /// Queue `message` for the writer task.
    ///
    /// `listeners` run exactly once with the write outcome. If the
    /// connection is already closed, or closes before the message is
    /// written, they observe an error.
    pub fn write(&self, message: ResponseMessage, listeners: Vec<WriteListener>) -> WriteCompletion {
        let (done_tx, done_rx) = oneshot::channel();
        let outbound = Outbound::new(message, listeners, done_tx);
        if !self.is_active() {
            outbound.complete(Err(closed_error()));
        } else if let Err(mpsc::error::SendError(outbound)) = self.inner.outbound.send(outbound) {
            outbound.complete(Err(closed_error()));
        }
        WriteCompletion::new(done_rx)
    }
}

pub(crate) fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
}

/// Reverse-direction handle to the client on the other end of a connection.
#[derive(Clone)]
pub struct TransportClient {
    channel: Channel,
    client_id: Arc<Mutex<Option<String>>>,
}

impl TransportClient {
    /// Wrap `channel`.
    #[must_use]
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            client_id: Arc::new(Mutex::new(None)),
        }
    }

    /// Identity the client authenticated as, if any.
    #[must_use]
    pub fn client_id(&self) -> Option<String> {
        self.client_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record the identity the client authenticated as.
    pub fn set_client_id(&self, id: impl Into<String>) {
        *self.client_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(id.into());
    }

    /// Identifier of the underlying connection.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId { self.channel.id() }

    /// Address of the peer, when known.
    #[must_use]
    pub fn remote_address(&self) -> Option<SocketAddr> { self.channel.remote_address() }

    /// Whether the connection is still open.
    #[must_use]
    pub fn is_active(&self) -> bool { self.channel.is_active() }

    /// Close the connection.
    pub fn close(&self) { self.channel.close(); }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rstest::{fixture, rstest};

    use super::*;
    use crate::buffer::ManagedBuffer;

    #[fixture]
    fn channel() -> (Channel, mpsc::UnboundedReceiver<Outbound>) {
        Channel::new(ConnectionId::new(1), None, InterceptorSlot::new())
    }

    fn response() -> ResponseMessage {
        ResponseMessage::RpcResponse {
            request_id: 1,
            body: ManagedBuffer::empty(),
        }
    }

    #[rstest]
    #[tokio::test]
    async fn write_after_close_fails_listeners(
        channel: (Channel, mpsc::UnboundedReceiver<Outbound>),
    ) {
        let (channel, _rx) = channel;
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        channel.close();
        assert!(!channel.is_active());
        let result = channel
            .write(
                response(),
                vec![Box::new(move |res: &io::Result<()>| {
                    assert!(res.is_err());
                    seen.fetch_add(1, Ordering::SeqCst);
                })],
            )
            .await;
        assert_eq!(result.expect_err("closed").kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn dropped_writer_fails_pending_writes(
        channel: (Channel, mpsc::UnboundedReceiver<Outbound>),
    ) {
        let (channel, mut rx) = channel;
        let completion = channel.write(response(), Vec::new());
        let queued = rx.recv().await.expect("queued write");
        drop(queued);
        assert!(completion.await.is_err());
    }

    #[rstest]
    fn client_id_round_trips(channel: (Channel, mpsc::UnboundedReceiver<Outbound>)) {
        let client = TransportClient::new(channel.0);
        assert_eq!(client.client_id(), None);
        client.set_client_id("app-1");
        assert_eq!(client.client_id().as_deref(), Some("app-1"));
        assert_eq!(client.connection_id(), ConnectionId::new(1));
    }
}
