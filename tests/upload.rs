//! Two-stage uploads: a header frame followed by raw body bytes.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use rstest::rstest;
use shuffle_transport::{ManagedBuffer, RequestMessage, TransportConf, UploadStream};
use transport_testing::{
    ChannelEvent,
    FixtureStreams,
    ScriptedHandler,
    UploadScript,
    serve_duplex,
};

mod common;
use common::{handler, rpc_failure, rpc_success, streams};

#[rstest]
#[tokio::test]
async fn empty_upload_completes_immediately(handler: Arc<ScriptedHandler>) {
    let (mut client, _server) = serve_duplex(handler.clone(), TransportConf::default());

    client.upload(7, b"meta", b"").await.expect("send upload");
    let reply = client.expect_response().await.expect("upload reply");

    assert_eq!(rpc_success(reply), (7, Vec::new()));
    let uploads = handler.uploads();
    assert_eq!(uploads.len(), 1);
    assert!(uploads[0].completed);
    assert!(uploads[0].data.is_empty());
    assert_eq!(uploads[0].meta, Bytes::from_static(b"meta"));
}

#[rstest]
#[tokio::test]
async fn upload_body_is_consumed_before_next_frame(handler: Arc<ScriptedHandler>) {
    let (mut client, _server) = serve_duplex(handler.clone(), TransportConf::default());

    client
        .upload(8, b"block-1", b"0123456789")
        .await
        .expect("send upload");
    let upload_reply = client.expect_response().await.expect("upload reply");
    let rpc_reply = client
        .rpc(9, Bytes::from_static(b"after"))
        .await
        .expect("rpc reply");

    assert_eq!(rpc_success(upload_reply), (8, Vec::new()));
    assert_eq!(rpc_success(rpc_reply), (9, b"after".to_vec()));
    let uploads = handler.uploads();
    assert_eq!(uploads[0].data, b"0123456789".to_vec());
    assert!(uploads[0].completed);
    assert_eq!(uploads[0].failure, None);
}

#[rstest]
#[tokio::test]
async fn upload_body_may_arrive_in_pieces(handler: Arc<ScriptedHandler>) {
    let (mut client, _server) = serve_duplex(handler.clone(), TransportConf::default());

    client
        .send(RequestMessage::Upload(UploadStream {
            request_id: 4,
            meta: ManagedBuffer::from(&b"m"[..]),
            body_byte_count: 6,
        }))
        .await
        .expect("send header");
    client.send_raw(b"abc").await.expect("first piece");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(handler.uploads()[0].data, b"abc".to_vec());
    assert!(!handler.uploads()[0].completed);
    client.send_raw(b"def").await.expect("second piece");

    let reply = client.expect_response().await.expect("upload reply");
    assert_eq!(rpc_success(reply).0, 4);
    assert_eq!(handler.uploads()[0].data, b"abcdef".to_vec());
}

#[rstest]
#[tokio::test]
async fn post_processing_failure_fails_rpc_but_keeps_connection(streams: Arc<FixtureStreams>) {
    let handler = Arc::new(
        ScriptedHandler::new(streams)
            .with_upload(UploadScript::FailOnComplete("checksum mismatch".into())),
    );
    let (mut client, _server) = serve_duplex(handler.clone(), TransportConf::default());

    client.upload(5, b"m", b"xyz").await.expect("send upload");
    let (request_id, error) = rpc_failure(client.expect_response().await.expect("reply"));
    assert_eq!(request_id, 5);
    assert!(error.contains("checksum mismatch"), "error: {error}");

    let reply = client
        .rpc(6, Bytes::from_static(b"ok?"))
        .await
        .expect("rpc after failed upload");
    assert_eq!(rpc_success(reply).0, 6);
    assert!(handler.uploads()[0].failure.is_some());
}

#[rstest]
#[tokio::test]
async fn rejected_upload_fails_rpc_and_closes_connection(streams: Arc<FixtureStreams>) {
    let handler = Arc::new(
        ScriptedHandler::new(streams).with_upload(UploadScript::Reject("disk full".into())),
    );
    let (mut client, server) = serve_duplex(handler.clone(), TransportConf::default());

    client
        .send(RequestMessage::Upload(UploadStream {
            request_id: 3,
            meta: ManagedBuffer::from(&b"m"[..]),
            body_byte_count: 1024,
        }))
        .await
        .expect("send header");

    let (request_id, error) = rpc_failure(client.expect_response().await.expect("reply"));
    assert_eq!(request_id, 3);
    assert!(error.contains("disk full"), "error: {error}");
    assert!(client.is_closed().await);
    server.await.expect("join connection");
    assert!(
        handler
            .events()
            .iter()
            .any(|event| matches!(event, ChannelEvent::Exception(msg) if msg.contains("request 3")))
    );
}

#[rstest]
#[tokio::test]
async fn disconnect_mid_upload_fails_consumer(handler: Arc<ScriptedHandler>) {
    let (mut client, server) = serve_duplex(handler.clone(), TransportConf::default());

    client
        .send(RequestMessage::Upload(UploadStream {
            request_id: 2,
            meta: ManagedBuffer::from(&b"m"[..]),
            body_byte_count: 100,
        }))
        .await
        .expect("send header");
    client.send_raw(b"partial").await.expect("partial body");
    tokio::time::sleep(Duration::from_millis(10)).await;
    drop(client);
    server.await.expect("join connection");

    let upload = &handler.uploads()[0];
    assert_eq!(upload.data, b"partial".to_vec());
    assert!(!upload.completed);
    assert_eq!(upload.failure.as_deref(), Some("channel closed"));
}
