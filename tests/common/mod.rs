//! Fixtures shared by the integration tests.

#![allow(
    dead_code,
    reason = "shared test utilities are not used by all test binaries"
)]

use std::sync::Arc;

use rstest::fixture;
use shuffle_transport::ResponseMessage;
use transport_testing::{FixtureStreams, ScriptedHandler};

/// Fixture streams with nothing in flight.
#[fixture]
pub fn streams() -> Arc<FixtureStreams> { Arc::new(FixtureStreams::new()) }

/// A registered handler serving `streams`.
#[fixture]
pub fn handler(streams: Arc<FixtureStreams>) -> Arc<ScriptedHandler> {
    Arc::new(ScriptedHandler::new(streams))
}

/// Body and request id of an RPC success, panicking on anything else.
pub fn rpc_success(response: ResponseMessage) -> (u64, Vec<u8>) {
    match response {
        ResponseMessage::RpcResponse { request_id, body } => (request_id, body.as_slice().to_vec()),
        other => panic!("expected RpcResponse, got {other}"),
    }
}

/// Error text and request id of an RPC failure, panicking on anything else.
pub fn rpc_failure(response: ResponseMessage) -> (u64, String) {
    match response {
        ResponseMessage::RpcFailure { request_id, error } => (request_id, error),
        other => panic!("expected RpcFailure, got {other}"),
    }
}
