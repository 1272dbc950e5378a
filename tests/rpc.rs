//! Generic RPCs and one-way messages.

use std::sync::Arc;

use bytes::Bytes;
use rstest::rstest;
use shuffle_transport::TransportConf;
use transport_testing::{RpcScript, ScriptedHandler, serve_duplex};

mod common;
use common::{handler, rpc_failure, rpc_success};

#[rstest]
#[tokio::test]
async fn rpc_reply_carries_request_id(handler: Arc<ScriptedHandler>) {
    let (mut client, _server) = serve_duplex(handler, TransportConf::default());

    let reply = client
        .rpc(42, Bytes::from_static(b"ping"))
        .await
        .expect("rpc reply");
    assert_eq!(rpc_success(reply), (42, b"ping".to_vec()));
}

#[rstest]
#[tokio::test]
async fn handler_error_fails_rpc_and_keeps_connection(handler: Arc<ScriptedHandler>) {
    handler.set_rpc(RpcScript::Fail("shuffle not found".into()));
    let (mut client, _server) = serve_duplex(handler.clone(), TransportConf::default());

    let reply = client
        .rpc(1, Bytes::from_static(b"open"))
        .await
        .expect("rpc reply");
    let (request_id, error) = rpc_failure(reply);
    assert_eq!(request_id, 1);
    assert!(error.contains("shuffle not found"), "error: {error}");

    handler.set_rpc(RpcScript::Reply(Bytes::from_static(b"ok")));
    let reply = client
        .rpc(2, Bytes::from_static(b"open"))
        .await
        .expect("rpc reply");
    assert_eq!(rpc_success(reply), (2, b"ok".to_vec()));
}

#[rstest]
#[tokio::test]
async fn handler_panic_becomes_rpc_failure(handler: Arc<ScriptedHandler>) {
    handler.set_rpc(RpcScript::Panic("kaboom".into()));
    let (mut client, _server) = serve_duplex(handler.clone(), TransportConf::default());

    let reply = client
        .rpc(9, Bytes::from_static(b"x"))
        .await
        .expect("rpc reply");
    assert_eq!(rpc_failure(reply), (9, "handler panicked: kaboom".to_owned()));

    handler.set_rpc(RpcScript::Echo);
    let reply = client
        .rpc(10, Bytes::from_static(b"still here"))
        .await
        .expect("rpc reply");
    assert_eq!(rpc_success(reply).1, b"still here".to_vec());
}

#[rstest]
#[tokio::test]
async fn one_way_messages_reach_handler_without_reply(handler: Arc<ScriptedHandler>) {
    let (mut client, _server) = serve_duplex(handler.clone(), TransportConf::default());

    client
        .one_way(Bytes::from_static(b"heartbeat"))
        .await
        .expect("send one-way");
    // Requests are dispatched in order, so the RPC reply comes after the
    // one-way message was handled.
    let reply = client
        .rpc(3, Bytes::from_static(b"sync"))
        .await
        .expect("rpc reply");
    assert_eq!(rpc_success(reply).0, 3);
    assert_eq!(
        handler.one_way_messages(),
        vec![Bytes::from_static(b"heartbeat")]
    );
}

#[rstest]
#[tokio::test]
async fn lifecycle_events_reach_handler(handler: Arc<ScriptedHandler>) {
    let (mut client, server) = serve_duplex(handler.clone(), TransportConf::default());
    client
        .rpc(1, Bytes::from_static(b"hello"))
        .await
        .expect("rpc reply");

    drop(client);
    server.await.expect("join connection");
    assert_eq!(
        handler.events(),
        vec![
            transport_testing::ChannelEvent::Active,
            transport_testing::ChannelEvent::Inactive
        ]
    );
}
