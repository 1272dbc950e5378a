//! Test helpers shared across server modules.

use std::{
    net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener},
    sync::Arc,
};

use bytes::Bytes;
use rstest::fixture;

use super::{Bound, TransportServer};
use crate::{
    channel::TransportClient,
    error::BoxError,
    handler::{RpcHandler, RpcResponseCallback},
    stream_manager::{OneForOneStreamManager, StreamManager},
};

/// Handler that echoes RPC bodies.
pub struct EchoHandler {
    streams: Arc<OneForOneStreamManager>,
}

impl RpcHandler for EchoHandler {
    fn receive(
        &self,
        _client: &TransportClient,
        message: Bytes,
        callback: Arc<dyn RpcResponseCallback>,
    ) -> Result<(), BoxError> {
        callback.on_success(message);
        Ok(())
    }

    fn stream_manager(&self) -> Arc<dyn StreamManager> { self.streams.clone() }
}

#[fixture]
pub fn handler() -> Arc<dyn RpcHandler> {
    Arc::new(EchoHandler {
        streams: Arc::new(OneForOneStreamManager::new()),
    })
}

#[fixture]
/// Returns a bound [`StdTcpListener`] on a free port for use in tests.
///
/// Keeping the listener bound prevents race conditions where another
/// process could claim the port between discovery and use.
pub fn free_listener() -> StdTcpListener {
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0);
    StdTcpListener::bind(addr).expect("Failed to bind free port listener")
}

/// Bind a server for `handler` to `listener`.
pub fn bind_server(
    handler: Arc<dyn RpcHandler>,
    listener: StdTcpListener,
) -> TransportServer<Bound> {
    TransportServer::new(handler)
        .bind_existing_listener(listener)
        .expect("Failed to bind")
}
