//! Failure logs carry the context needed to trace a fault to its client.

use std::sync::Arc;

use bytes::Bytes;
use log::Level;
use rstest::rstest;
use serial_test::serial;
use shuffle_transport::{ChunkFetchRequest, RequestMessage, StreamChunkId, TransportConf};
use transport_testing::{
    CHUNK_STREAM_ID,
    FixtureStreams,
    LoggerHandle,
    PushScript,
    RpcScript,
    ScriptedHandler,
    logger,
    serve_duplex,
};

#[rstest]
#[serial(transport_logs)]
#[tokio::test]
async fn backpressure_close_logs_counts(mut logger: LoggerHandle) {
    let streams = Arc::new(FixtureStreams::new().with_in_flight(2));
    let handler = Arc::new(ScriptedHandler::new(streams));
    let conf = TransportConf::default().with_max_chunks_being_transferred(2);
    let (mut client, server) = serve_duplex(handler, conf);

    client
        .send(RequestMessage::ChunkFetch(ChunkFetchRequest {
            stream_chunk_id: StreamChunkId::new(CHUNK_STREAM_ID, 0),
        }))
        .await
        .expect("send fetch");
    assert!(client.is_closed().await);
    server.await.expect("join connection");

    assert!(logger.contains(
        Level::Warn,
        &[
            "chunks in flight at limit",
            "request=StreamChunkId[streamId=1,chunkIndex=0]",
            "in_flight=2",
            "max=2",
        ],
    ));
}

#[rstest]
#[serial(transport_logs)]
#[tokio::test]
async fn rpc_failure_logs_request_id(mut logger: LoggerHandle) {
    let handler = Arc::new(
        ScriptedHandler::new(Arc::new(FixtureStreams::new()))
            .with_rpc(RpcScript::Fail("lost partition".into())),
    );
    let (mut client, _server) = serve_duplex(handler, TransportConf::default());

    client
        .rpc(77, Bytes::from_static(b"x"))
        .await
        .expect("rpc reply");

    assert!(logger.contains(
        Level::Error,
        &["rpc handler failed", "request_id=77", "error=lost partition"],
    ));
}

#[rstest]
#[serial(transport_logs)]
#[tokio::test]
async fn chunk_failure_logs_stream_chunk_id(mut logger: LoggerHandle) {
    let handler = Arc::new(ScriptedHandler::new(Arc::new(FixtureStreams::new())));
    let (mut client, _server) = serve_duplex(handler, TransportConf::default());

    client.fetch_chunk(99, 0).await.expect("chunk response");

    assert!(logger.contains(
        Level::Error,
        &[
            "error opening chunk",
            "stream_chunk_id=StreamChunkId[streamId=99,chunkIndex=0]",
            "unknown stream id 99",
        ],
    ));
}

#[rstest]
#[serial(transport_logs)]
#[tokio::test]
async fn push_callback_failure_logs_partition(mut logger: LoggerHandle) {
    let handler = Arc::new(
        ScriptedHandler::new(Arc::new(FixtureStreams::new()))
            .with_push(PushScript::Fail("partition split".into())),
    );
    let (mut client, _server) = serve_duplex(handler, TransportConf::default());

    client
        .push_data(31, "app-7-1", "4-0", Bytes::from_static(b"rows"))
        .await
        .expect("push reply");
    client
        .push_merged_data(32, "app-7-1", &[("5-0", &b"a"[..]), ("6-0", &b"b"[..])])
        .await
        .expect("merged push reply");

    let logs = logger.drain();
    let logged = |fragments: &[&str]| {
        logs.iter().any(|(level, msg)| {
            *level == Level::Error && fragments.iter().all(|fragment| msg.contains(fragment))
        })
    };
    assert!(logged(&[
        "push data failed",
        "request_id=31",
        "shuffle_key=app-7-1",
        "partition_unique_id=4-0",
        "error=partition split",
    ]));
    assert!(logged(&[
        "push merged data failed",
        "request_id=32",
        "shuffle_key=app-7-1",
        "partition_unique_ids=[\"5-0\", \"6-0\"]",
        "error=partition split",
    ]));
}
