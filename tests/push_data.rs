//! Shuffle data pushes.

use std::sync::Arc;

use bytes::Bytes;
use rstest::rstest;
use shuffle_transport::TransportConf;
use transport_testing::{FixtureStreams, PushScript, ScriptedHandler, serve_duplex};

mod common;
use common::{handler, rpc_failure, rpc_success};

#[rstest]
#[tokio::test]
async fn push_data_is_acknowledged(handler: Arc<ScriptedHandler>) {
    let (mut client, _server) = serve_duplex(handler.clone(), TransportConf::default());

    let reply = client
        .push_data(21, "app-7-1", "3-0", Bytes::from_static(b"serialized rows"))
        .await
        .expect("push reply");

    assert_eq!(rpc_success(reply), (21, Vec::new()));
    assert_eq!(handler.pushed_partitions(), vec!["3-0".to_owned()]);
}

#[rstest]
#[tokio::test]
async fn merged_push_covers_every_partition(handler: Arc<ScriptedHandler>) {
    let (mut client, _server) = serve_duplex(handler.clone(), TransportConf::default());

    let reply = client
        .push_merged_data(
            22,
            "app-7-1",
            &[("0-0", &b"aaaa"[..]), ("1-0", &b"bb"[..]), ("2-0", &b""[..])],
        )
        .await
        .expect("merged push reply");

    assert_eq!(rpc_success(reply).0, 22);
    assert_eq!(handler.pushed_partitions(), vec!["0-0", "1-0", "2-0"]);
}

#[rstest]
#[tokio::test]
async fn push_callback_failure_sends_message_only() {
    let handler = Arc::new(
        ScriptedHandler::new(Arc::new(FixtureStreams::new()))
            .with_push(PushScript::Fail("partition split".into())),
    );
    let (mut client, _server) = serve_duplex(handler.clone(), TransportConf::default());

    let reply = client
        .push_data(23, "app-7-1", "4-0", Bytes::from_static(b"rows"))
        .await
        .expect("push reply");

    assert_eq!(rpc_failure(reply), (23, "partition split".to_owned()));
    assert_eq!(handler.pushed_partitions(), vec!["4-0".to_owned()]);
}
