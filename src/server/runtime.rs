//! Runtime control for [`TransportServer`].

mod backoff;

use std::{future::Future, sync::Arc, time::Duration};

pub use backoff::BackoffConfig;
use log::{info, warn};
use tokio::{net::TcpListener, select, signal, time::sleep};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{Bound, ServerError, TransportServer, connection::spawn_connection_task};
use crate::{config::TransportConf, handler::RpcHandler};

impl TransportServer<Bound> {
    /// Run the server until Ctrl+C is received.
    ///
    /// # Errors
    ///
    /// Accept failures are retried with exponential back-off and do not
    /// surface as errors.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_with_shutdown(async {
            let _ = signal::ctrl_c().await;
        })
        .await
    }

    /// Run the server until the `shutdown` future resolves.
    ///
    /// Once `shutdown` resolves the accept loop stops, every open connection
    /// is closed and the call returns after their tasks finish.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    ///
    /// use bytes::Bytes;
    /// use shuffle_transport::{
    ///     channel::TransportClient,
    ///     error::BoxError,
    ///     handler::{RpcHandler, RpcResponseCallback},
    ///     server::TransportServer,
    ///     stream_manager::{OneForOneStreamManager, StreamManager},
    /// };
    /// use tokio::sync::oneshot;
    ///
    /// struct Echo(Arc<OneForOneStreamManager>);
    ///
    /// impl RpcHandler for Echo {
    ///     fn receive(
    ///         &self,
    ///         _client: &TransportClient,
    ///         message: Bytes,
    ///         callback: Arc<dyn RpcResponseCallback>,
    ///     ) -> Result<(), BoxError> {
    ///         callback.on_success(message);
    ///         Ok(())
    ///     }
    ///
    ///     fn stream_manager(&self) -> Arc<dyn StreamManager> { self.0.clone() }
    /// }
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), shuffle_transport::server::ServerError> {
    /// let handler = Arc::new(Echo(Arc::new(OneForOneStreamManager::new())));
    /// let server = TransportServer::new(handler).bind(([127, 0, 0, 1], 0).into())?;
    ///
    /// let (tx, rx) = oneshot::channel::<()>();
    /// let handle = tokio::spawn(async move {
    ///     server
    ///         .run_with_shutdown(async {
    ///             let _ = rx.await;
    ///         })
    ///         .await
    /// });
    ///
    /// let _ = tx.send(());
    /// handle
    ///     .await
    ///     .expect("join server task")
    ///     .expect("server run failed");
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// Accept failures are retried with exponential back-off and do not
    /// surface as errors.
    pub async fn run_with_shutdown<S>(self, shutdown: S) -> Result<(), ServerError>
    where
        S: Future<Output = ()> + Send,
    {
        let TransportServer {
            handler,
            conf,
            ready_tx,
            state: Bound { listener },
        } = self;
        let shutdown_token = CancellationToken::new();
        let tracker = TaskTracker::new();

        if let Ok(addr) = listener.local_addr() {
            info!("transport server listening: local_addr={addr}");
        }
        tracker.spawn(accept_loop(
            listener,
            handler,
            conf,
            shutdown_token.clone(),
            tracker.clone(),
        ));

        if let Some(tx) = ready_tx
            && tx.send(()).is_err()
        {
            warn!("Failed to send readiness signal: receiver dropped");
        }

        select! {
            () = shutdown => shutdown_token.cancel(),
            () = tracker.wait() => {},
        }

        tracker.close();
        tracker.wait().await;
        Ok(())
    }
}

/// Accept connections until `shutdown` is cancelled.
///
/// Each connection is served on its own task tracked by `tracker`. Accept
/// failures back off exponentially as configured by `conf.backoff`.
pub(super) async fn accept_loop(
    listener: Arc<TcpListener>,
    handler: Arc<dyn RpcHandler>,
    conf: TransportConf,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    let backoff = conf.backoff.normalized();
    let mut delay = backoff.initial_delay;
    while let Some(next_delay) =
        accept_iteration(&listener, &handler, &conf, &shutdown, &tracker, &backoff, delay).await
    {
        delay = next_delay;
    }
}

async fn accept_iteration(
    listener: &TcpListener,
    handler: &Arc<dyn RpcHandler>,
    conf: &TransportConf,
    shutdown: &CancellationToken,
    tracker: &TaskTracker,
    backoff: &BackoffConfig,
    delay: Duration,
) -> Option<Duration> {
    select! {
        biased;

        () = shutdown.cancelled() => None,
        res = listener.accept() => Some(match res {
            Ok((stream, _)) => {
                spawn_connection_task(
                    stream,
                    Arc::clone(handler),
                    *conf,
                    shutdown.clone(),
                    tracker,
                );
                backoff.initial_delay
            }
            Err(e) => {
                let local_addr = listener.local_addr().ok();
                warn!("accept error: error={e:?}, local_addr={local_addr:?}");
                sleep(delay).await;
                backoff.next_delay(delay)
            }
        }),
    }
}
