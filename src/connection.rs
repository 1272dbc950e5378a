//! Per-connection driver.
//!
//! [`serve_connection`] splits a stream into a frame reader and a frame
//! writer. Decoded requests are dispatched one at a time in arrival order;
//! responses queued by the dispatcher, possibly from other threads, are
//! written by the writer half. Decode failures and escalated dispatch errors
//! run the connection's exception path and close it.

use std::{net::SocketAddr, sync::Arc};

use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    select,
    sync::mpsc,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};

use crate::{
    channel::{Channel, TransportClient},
    codec::{CodecError, TransportCodec},
    config::TransportConf,
    dispatcher::RequestDispatcher,
    error::{SharedError, TransportError, error_detail},
    handler::RpcHandler,
    interceptor::InterceptorSlot,
    protocol::{Message, ResponseMessage},
    response::Outbound,
    session::ConnectionId,
};

/// Serve one connection until the peer disconnects, the connection is
/// closed or `shutdown` is cancelled.
///
/// On exit any installed interceptor is told the channel went inactive, then
/// the dispatcher is, and finally responses already queued are flushed.
pub async fn serve_connection<S>(
    stream: S,
    remote_addr: Option<SocketAddr>,
    handler: Arc<dyn RpcHandler>,
    conf: &TransportConf,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send,
{
    let id = ConnectionId::next();
    let slot = InterceptorSlot::new();
    let codec = TransportCodec::with_interceptor(conf.max_frame_length(), slot.clone());
    let (reader, writer) = tokio::io::split(stream);
    let mut frames = FramedRead::new(reader, codec.clone());
    let sink = FramedWrite::new(writer, codec);

    let (channel, outbound) = Channel::new(id, remote_addr, slot.clone());
    let client = TransportClient::new(channel.clone());
    let dispatcher =
        RequestDispatcher::new(channel.clone(), client, handler, conf.max_chunks_being_transferred);
    debug!("connection active: id={id}, remote_addr={remote_addr:?}");
    dispatcher.channel_active();

    let read = async {
        read_loop(&mut frames, &dispatcher, &channel, &shutdown).await;
        channel.close();
        slot.channel_inactive();
        dispatcher.channel_inactive();
    };
    let write = write_loop(sink, outbound, channel.closed_token().clone());
    tokio::join!(read, write);
    debug!("connection closed: id={id}, remote_addr={remote_addr:?}");
}

async fn read_loop<R>(
    frames: &mut FramedRead<R, TransportCodec>,
    dispatcher: &RequestDispatcher,
    channel: &Channel,
    shutdown: &CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let next = select! {
            biased;

            () = channel.closed_token().cancelled() => return,
            () = shutdown.cancelled() => {
                debug!("server shutting down; closing connection: id={}", channel.id());
                return;
            }
            next = frames.next() => next,
        };
        match next {
            None => {
                debug!(
                    "peer closed connection: id={}, remote_addr={:?}",
                    channel.id(),
                    channel.remote_address()
                );
                return;
            }
            Some(Ok(Message::Request(request))) => {
                if let Err(e) = dispatcher.handle(request) {
                    exception_caught(dispatcher, channel, e.shared());
                    return;
                }
            }
            Some(Ok(Message::Response(response))) => {
                warn!(
                    "ignoring response sent by client: response={response}, remote_addr={:?}",
                    channel.remote_address()
                );
            }
            Some(Err(e)) => {
                exception_caught(dispatcher, channel, TransportError::from(e).shared());
                return;
            }
        }
    }
}

fn exception_caught(dispatcher: &RequestDispatcher, channel: &Channel, cause: SharedError) {
    warn!(
        "exception in connection; closing it: id={}, remote_addr={:?}, error={}",
        channel.id(),
        channel.remote_address(),
        error_detail(&*cause)
    );
    channel.interceptor().exception_caught(Arc::clone(&cause));
    dispatcher.exception_caught(&cause);
    channel.close();
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, TransportCodec>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        // Drain queued responses before honouring a close.
        let mut item = select! {
            biased;

            item = outbound.recv() => match item {
                Some(item) => item,
                None => break,
            },
            () = closed.cancelled() => break,
        };
        let result = match item.take_message() {
            Some(message) => sink.send(message).await.map_err(into_io),
            None => Ok(()),
        };
        item.complete(result);
    }
    outbound.close();
    drop(outbound);
    if let Err(e) = SinkExt::<ResponseMessage>::close(&mut sink).await {
        debug!("failed to shut down connection writer: error={e}");
    }
}

fn into_io(e: CodecError) -> std::io::Error {
    match e {
        CodecError::Io(e) => e,
        other => std::io::Error::other(other),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::{Bytes, BytesMut};
    use rstest::rstest;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt, duplex},
        time::timeout,
    };
    use tokio_util::codec::{Decoder, Encoder};

    use super::*;
    use crate::{
        error::BoxError,
        handler::RpcResponseCallback,
        protocol::{RequestMessage, RpcRequest},
        stream_manager::{OneForOneStreamManager, StreamManager},
    };

    struct Echo(Arc<OneForOneStreamManager>);

    impl RpcHandler for Echo {
        fn receive(
            &self,
            _client: &TransportClient,
            message: Bytes,
            callback: Arc<dyn RpcResponseCallback>,
        ) -> Result<(), BoxError> {
            callback.on_success(message);
            Ok(())
        }

        fn stream_manager(&self) -> Arc<dyn StreamManager> { self.0.clone() }
    }

    #[rstest]
    #[tokio::test]
    async fn echoes_rpc_and_stops_on_eof() {
        let (mut client, server) = duplex(1024);
        let handler = Arc::new(Echo(Arc::new(OneForOneStreamManager::new())));
        let task = tokio::spawn(async move {
            serve_connection(
                server,
                None,
                handler,
                &TransportConf::default(),
                CancellationToken::new(),
            )
            .await;
        });

        let mut codec = TransportCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(
                RequestMessage::Rpc(RpcRequest {
                    request_id: 77,
                    body: Bytes::from_static(b"echo").into(),
                }),
                &mut buf,
            )
            .expect("encode request");
        client.write_all(&buf).await.expect("send request");

        let mut received = BytesMut::new();
        let response = loop {
            if let Some(message) = codec.decode(&mut received).expect("decode response") {
                break message;
            }
            let n = timeout(Duration::from_secs(5), client.read_buf(&mut received))
                .await
                .expect("response in time")
                .expect("read response");
            assert!(n > 0, "connection closed before responding");
        };
        let Message::Response(ResponseMessage::RpcResponse { request_id, body }) = response else {
            panic!("expected rpc response");
        };
        assert_eq!(request_id, 77);
        assert_eq!(body.as_slice(), b"echo");

        drop(client);
        timeout(Duration::from_secs(5), task)
            .await
            .expect("connection task ends after eof")
            .expect("connection task");
    }

    #[rstest]
    #[tokio::test]
    async fn shutdown_token_closes_idle_connection() {
        let (mut client, server) = duplex(1024);
        let handler = Arc::new(Echo(Arc::new(OneForOneStreamManager::new())));
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            serve_connection(server, None, handler, &TransportConf::default(), token).await;
        });

        shutdown.cancel();
        timeout(Duration::from_secs(5), task)
            .await
            .expect("connection task ends after shutdown")
            .expect("connection task");
        let mut rest = Vec::new();
        timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .expect("writer shut down")
            .expect("read to eof");
        assert!(rest.is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn garbage_frame_closes_connection() {
        let (mut client, server) = duplex(1024);
        let handler = Arc::new(Echo(Arc::new(OneForOneStreamManager::new())));
        let task = tokio::spawn(async move {
            serve_connection(
                server,
                None,
                handler,
                &TransportConf::default(),
                CancellationToken::new(),
            )
            .await;
        });

        client
            .write_all(&[0, 0, 0, 1, 0xff])
            .await
            .expect("send garbage");
        timeout(Duration::from_secs(5), task)
            .await
            .expect("connection task ends after decode failure")
            .expect("connection task");
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.expect("read to eof");
        assert!(rest.is_empty());
    }
}
