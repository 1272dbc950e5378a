//! Outbound response plumbing.
//!
//! [`ResponseWriter`] queues a [`ResponseMessage`] on the connection and
//! closes the connection if the write fails. Each queued write is an
//! [`Outbound`] whose listeners run exactly once: with the write outcome when
//! the writer task gets to it, or with an error if the connection goes away
//! first.

use std::{
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
};

use log::{debug, warn};
use tokio::sync::oneshot;

use crate::{
    channel::{Channel, closed_error},
    protocol::ResponseMessage,
};

/// Listener invoked with the outcome of a write.
pub type WriteListener = Box<dyn FnOnce(&io::Result<()>) + Send + 'static>;

/// A response queued for the connection's writer task.
pub struct Outbound {
    message: Option<ResponseMessage>,
    listeners: Vec<WriteListener>,
    done: Option<oneshot::Sender<io::Result<()>>>,
}

impl Outbound {
    pub(crate) fn new(
        message: ResponseMessage,
        listeners: Vec<WriteListener>,
        done: oneshot::Sender<io::Result<()>>,
    ) -> Self {
        Self {
            message: Some(message),
            listeners,
            done: Some(done),
        }
    }

    /// Take the message for encoding. Returns `None` on the second call.
    pub fn take_message(&mut self) -> Option<ResponseMessage> { self.message.take() }

    /// Report the write outcome to listeners and the completion handle.
    pub fn complete(mut self, result: io::Result<()>) { self.finish(result); }

    fn finish(&mut self, result: io::Result<()>) {
        for listener in self.listeners.drain(..) {
            listener(&result);
        }
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
    }
}

impl Drop for Outbound {
    fn drop(&mut self) {
        if self.done.is_some() || !self.listeners.is_empty() {
            self.finish(Err(closed_error()));
        }
    }
}

/// Resolves once the associated response has been written or dropped.
///
/// Dropping it does not cancel the write.
pub struct WriteCompletion {
    rx: oneshot::Receiver<io::Result<()>>,
}

impl WriteCompletion {
    pub(crate) fn new(rx: oneshot::Receiver<io::Result<()>>) -> Self { Self { rx } }
}

impl Future for WriteCompletion {
    type Output = io::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or_else(|_| Err(closed_error())))
    }
}

/// Writes responses and closes the connection when a write fails.
#[derive(Clone)]
pub struct ResponseWriter {
    channel: Channel,
}

impl ResponseWriter {
    /// Create a writer for `channel`.
    #[must_use]
    pub fn new(channel: Channel) -> Self { Self { channel } }

    /// Queue `message`.
    ///
    /// A failed write is logged with the peer address and the connection is
    /// closed; it is never retried.
    pub fn respond(&self, message: ResponseMessage) -> WriteCompletion {
        self.respond_then(message, |_| {})
    }

    /// Queue `message` and run `on_complete` with the write outcome.
    ///
    /// `on_complete` runs exactly once, after the failure handling of
    /// [`respond`](Self::respond).
    pub fn respond_then<F>(&self, message: ResponseMessage, on_complete: F) -> WriteCompletion
    where
        F: FnOnce(&io::Result<()>) + Send + 'static,
    {
        let description = message.to_string();
        let channel = self.channel.clone();
        let on_failure = move |result: &io::Result<()>| match result {
            Ok(()) => {}
            Err(e) if !channel.is_active() => {
                debug!(
                    "response dropped on closed connection: response={description}, \
                     remote_addr={:?}, error={e}",
                    channel.remote_address()
                );
            }
            Err(e) => {
                warn!(
                    "error sending result; closing connection: response={description}, \
                     remote_addr={:?}, error={e}",
                    channel.remote_address()
                );
                channel.close();
            }
        };
        self.channel
            .write(message, vec![Box::new(on_failure), Box::new(on_complete)])
    }
}
