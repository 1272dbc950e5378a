//! Connection task spawning for [`TransportServer`](super::TransportServer).

use std::sync::Arc;

use futures::FutureExt;
use log::{error, warn};
use tokio::net::TcpStream;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config::TransportConf,
    connection::serve_connection,
    handler::RpcHandler,
    panic::format_panic,
};

/// Spawn a task to serve a single TCP connection, logging and discarding any
/// panics.
pub(super) fn spawn_connection_task(
    stream: TcpStream,
    handler: Arc<dyn RpcHandler>,
    conf: TransportConf,
    shutdown: CancellationToken,
    tracker: &TaskTracker,
) {
    let peer_addr = match stream.peer_addr() {
        Ok(addr) => Some(addr),
        Err(e) => {
            warn!("Failed to retrieve peer address: error={e}");
            None
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to disable Nagle: error={e}, peer_addr={peer_addr:?}");
    }
    tracker.spawn(async move {
        let fut = std::panic::AssertUnwindSafe(serve_connection(
            stream, peer_addr, handler, &conf, shutdown,
        ))
        .catch_unwind();

        if let Err(panic) = fut.await {
            let panic_msg = format_panic(&*panic);
            // Emit via both `log` and `tracing` for tests that capture either.
            error!("connection task panicked: panic={panic_msg}, peer_addr={peer_addr:?}");
            tracing::error!(panic = %panic_msg, ?peer_addr, "connection task panicked");
        }
    });
}
