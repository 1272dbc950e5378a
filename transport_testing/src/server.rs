//! Running a server for a test.

use std::{net::SocketAddr, sync::Arc};

use shuffle_transport::{
    RpcHandler,
    ServerError,
    TransportConf,
    TransportServer,
    connection::serve_connection,
};
use tokio::{io::DuplexStream, sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::client::TestClient;

const DUPLEX_CAPACITY: usize = 64 * 1024;

/// A TCP server running on a background task.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), ServerError>>,
}

impl ServerHandle {
    /// Address the server accepts connections on.
    #[must_use]
    pub fn addr(&self) -> SocketAddr { self.addr }

    /// Stop the server and wait for every connection to finish.
    ///
    /// # Panics
    ///
    /// Panics if the server task panicked or failed.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task
            .await
            .expect("join server task")
            .expect("server run failed");
    }
}

/// Bind `handler` to an ephemeral localhost port and serve it until the
/// returned handle is shut down.
///
/// # Panics
///
/// Panics if binding fails or the server never becomes ready.
pub async fn spawn_server(handler: Arc<dyn RpcHandler>, conf: TransportConf) -> ServerHandle {
    let (ready_tx, ready_rx) = oneshot::channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = TransportServer::new(handler)
        .with_conf(conf)
        .ready_signal(ready_tx)
        .bind(([127, 0, 0, 1], 0).into())
        .expect("bind test server");
    let addr = server.local_addr().expect("bound address");
    let task = tokio::spawn(server.run_with_shutdown(async {
        let _ = shutdown_rx.await;
    }));
    ready_rx.await.expect("server ready");
    ServerHandle {
        addr,
        shutdown: Some(shutdown_tx),
        task,
    }
}

/// Serve one connection over an in-memory pipe.
///
/// The returned task finishes once the connection closes, after the
/// handler has been told the channel went inactive.
pub fn serve_duplex(
    handler: Arc<dyn RpcHandler>,
    conf: TransportConf,
) -> (TestClient<DuplexStream>, JoinHandle<()>) {
    let (client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
    let task = tokio::spawn(async move {
        serve_connection(server, None, handler, &conf, CancellationToken::new()).await;
    });
    (TestClient::new(client), task)
}
