//! Tokio-based TCP server for the shuffle transport.
//!
//! [`TransportServer`] accepts connections and drives each one with
//! [`serve_connection`](crate::connection::serve_connection) on a tracked
//! task. Every connection shares the same [`RpcHandler`] and therefore the
//! same stream manager and in-flight transfer count.

use std::{
    net::{SocketAddr, TcpListener as StdTcpListener},
    sync::Arc,
};

use tokio::{net::TcpListener, sync::oneshot};

use crate::{config::TransportConf, handler::RpcHandler};

mod connection;
pub mod error;
mod runtime;

pub use error::ServerError;
pub use runtime::BackoffConfig;

/// TCP server dispatching every connection to one [`RpcHandler`].
///
/// The server carries a typestate `S` indicating whether it is [`Unbound`]
/// or [`Bound`]. New servers start `Unbound` and must call
/// [`bind`](TransportServer::bind) or
/// [`bind_existing_listener`](TransportServer::bind_existing_listener)
/// before running.
pub struct TransportServer<S = Unbound>
where
    S: ServerState,
{
    pub(crate) handler: Arc<dyn RpcHandler>,
    pub(crate) conf: TransportConf,
    /// Channel used to notify when the server is accepting connections.
    ///
    /// A `oneshot::Sender` can transmit only one readiness notification, so
    /// a new one must be provided each time the server is started.
    pub(crate) ready_tx: Option<oneshot::Sender<()>>,
    pub(crate) state: S,
}

/// Marker indicating the server has not yet bound a listener.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unbound;

/// Marker indicating the server is bound to a TCP listener.
#[derive(Debug, Clone)]
pub struct Bound {
    pub(crate) listener: Arc<TcpListener>,
}

/// Trait implemented by [`Unbound`] and [`Bound`] to model binding typestate.
pub trait ServerState: sealed::Sealed {}

mod sealed {
    //! Prevent external implementations of [`ServerState`].

    pub trait Sealed {}
    impl Sealed for super::Unbound {}
    impl Sealed for super::Bound {}
}

impl ServerState for Unbound {}
impl ServerState for Bound {}

impl TransportServer<Unbound> {
    /// Create a server for `handler` with default configuration.
    #[must_use]
    pub fn new(handler: Arc<dyn RpcHandler>) -> Self {
        Self {
            handler,
            conf: TransportConf::default(),
            ready_tx: None,
            state: Unbound,
        }
    }

    /// Return `None` as the server is not bound.
    #[must_use]
    pub const fn local_addr(&self) -> Option<SocketAddr> { None }

    /// Bind to `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if binding or configuring the listener
    /// fails.
    pub fn bind(self, addr: SocketAddr) -> Result<TransportServer<Bound>, ServerError> {
        let std_listener = StdTcpListener::bind(addr).map_err(ServerError::Bind)?;
        self.bind_existing_listener(std_listener)
    }

    /// Serve connections accepted by an existing listener.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the listener cannot be registered
    /// with the runtime.
    pub fn bind_existing_listener(
        self,
        std_listener: StdTcpListener,
    ) -> Result<TransportServer<Bound>, ServerError> {
        std_listener
            .set_nonblocking(true)
            .map_err(ServerError::Bind)?;
        let listener = TcpListener::from_std(std_listener).map_err(ServerError::Bind)?;
        Ok(TransportServer {
            handler: self.handler,
            conf: self.conf,
            ready_tx: self.ready_tx,
            state: Bound {
                listener: Arc::new(listener),
            },
        })
    }
}

impl<S: ServerState> TransportServer<S> {
    /// Replace the configuration.
    #[must_use]
    pub fn with_conf(mut self, conf: TransportConf) -> Self {
        self.conf = conf;
        self
    }

    /// Notify `tx` once the server starts accepting connections.
    #[must_use]
    pub fn ready_signal(mut self, tx: oneshot::Sender<()>) -> Self {
        self.ready_tx = Some(tx);
        self
    }

    /// The active configuration.
    #[must_use]
    pub fn conf(&self) -> &TransportConf { &self.conf }
}

impl TransportServer<Bound> {
    /// Address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> { self.state.listener.local_addr().ok() }
}

#[cfg(test)]
pub(crate) mod test_util;
