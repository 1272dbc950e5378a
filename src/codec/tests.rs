//! Unit tests for the transport frame codec.

use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};
use rstest::{fixture, rstest};

use super::*;
use crate::{
    error::{BoxError, SharedError},
    handler::StreamCallback,
    interceptor::StreamInterceptor,
};

#[fixture]
fn codec() -> TransportCodec { TransportCodec::new(1024) }

fn encode_request(codec: &mut TransportCodec, msg: RequestMessage) -> BytesMut {
    let mut buf = BytesMut::new();
    codec.encode(msg, &mut buf).expect("encode request");
    buf
}

fn decode_request(codec: &mut TransportCodec, buf: &mut BytesMut) -> RequestMessage {
    match codec.decode(buf).expect("decode").expect("complete frame") {
        Message::Request(req) => req,
        Message::Response(resp) => panic!("expected request, got {resp}"),
    }
}

#[derive(Clone, Default)]
struct Collect(Arc<Mutex<(Vec<u8>, bool)>>);

impl StreamCallback for Collect {
    fn on_data(&mut self, _stream_id: &str, buf: Bytes) -> Result<(), BoxError> {
        self.0.lock().expect("collect lock").0.extend_from_slice(&buf);
        Ok(())
    }

    fn on_complete(&mut self, _stream_id: &str) -> Result<(), BoxError> {
        self.0.lock().expect("collect lock").1 = true;
        Ok(())
    }

    fn on_failure(&mut self, _stream_id: &str, _cause: SharedError) -> Result<(), BoxError> {
        Ok(())
    }
}

#[rstest]
fn clamps_max_frame_length() {
    assert_eq!(
        TransportCodec::new(MAX_FRAME_LENGTH.saturating_add(1)).max_frame_length(),
        MAX_FRAME_LENGTH
    );
    assert_eq!(TransportCodec::new(1).max_frame_length(), MIN_FRAME_LENGTH);
}

#[rstest]
fn push_merged_data_keeps_header_and_body(mut codec: TransportCodec) {
    let mut buf = encode_request(
        &mut codec,
        RequestMessage::PushMergedData(PushMergedData {
            request_id: 9,
            shuffle_key: "app-1-0".into(),
            partition_unique_ids: vec!["0-0".into(), "1-0".into()],
            batch_offsets: vec![0, 3],
            body: ManagedBuffer::from(&b"abcdef"[..]),
        }),
    );
    let RequestMessage::PushMergedData(req) = decode_request(&mut codec, &mut buf) else {
        panic!("expected merged push");
    };
    assert_eq!(req.request_id, 9);
    assert_eq!(req.shuffle_key, "app-1-0");
    assert_eq!(req.partition_unique_ids, vec!["0-0", "1-0"]);
    assert_eq!(req.batch_offsets, vec![0, 3]);
    assert_eq!(req.body.as_slice(), b"abcdef");
    assert!(buf.is_empty());
}

#[rstest]
fn partial_frame_waits_for_more_bytes(mut codec: TransportCodec) {
    let full = encode_request(
        &mut codec,
        RequestMessage::Rpc(RpcRequest {
            request_id: 1,
            body: ManagedBuffer::from(&b"hello"[..]),
        }),
    );
    let mut buf = BytesMut::from(&full[..full.len() - 2]);
    assert!(codec.decode(&mut buf).expect("decode").is_none());
    buf.extend_from_slice(&full[full.len() - 2..]);
    let RequestMessage::Rpc(req) = decode_request(&mut codec, &mut buf) else {
        panic!("expected rpc");
    };
    assert_eq!(req.body.as_slice(), b"hello");
}

#[rstest]
fn rejects_oversized_length_prefix(mut codec: TransportCodec) {
    let mut buf = BytesMut::new();
    buf.put_u32(4096);
    buf.put_u8(MessageType::RpcRequest.as_u8());
    let err = codec.decode(&mut buf).expect_err("oversized frame");
    assert!(matches!(
        err,
        CodecError::Framing(FramingError::OversizedFrame {
            size: 4096,
            max: 1024
        })
    ));
}

#[rstest]
fn rejects_oversized_encode(mut codec: TransportCodec) {
    let mut buf = BytesMut::new();
    let err = codec
        .encode(
            ResponseMessage::RpcResponse {
                request_id: 1,
                body: ManagedBuffer::from(vec![0_u8; 2048]),
            },
            &mut buf,
        )
        .expect_err("body larger than the frame limit");
    assert!(matches!(err, CodecError::Framing(FramingError::OversizedFrame { .. })));
    assert!(buf.is_empty());
}

#[rstest]
fn rejects_unknown_message_type(mut codec: TransportCodec) {
    let mut buf = BytesMut::new();
    buf.put_u32(1);
    buf.put_u8(99);
    let err = codec.decode(&mut buf).expect_err("unknown tag");
    assert!(matches!(err, CodecError::UnknownMessageType { type_id: 99 }));
}

#[rstest]
fn truncated_frame_at_eof_is_an_error(mut codec: TransportCodec) {
    let mut buf = BytesMut::new();
    buf.put_u32(10);
    buf.put_u8(MessageType::RpcRequest.as_u8());
    let err = codec.decode_eof(&mut buf).expect_err("truncated frame");
    assert!(matches!(
        err,
        CodecError::Framing(FramingError::Truncated { bytes_received: 5 })
    ));
}

#[rstest]
fn stream_response_body_follows_frame(mut codec: TransportCodec) {
    let mut buf = BytesMut::new();
    codec
        .encode(
            ResponseMessage::StreamResponse {
                stream_id: "file".into(),
                byte_count: 4,
                body: ManagedBuffer::from(&b"data"[..]),
            },
            &mut buf,
        )
        .expect("encode stream response");
    assert_eq!(&buf[buf.len() - 4..], b"data");

    let Some(Message::Response(ResponseMessage::StreamResponse {
        stream_id,
        byte_count,
        body,
    })) = codec.decode(&mut buf).expect("decode")
    else {
        panic!("expected stream response");
    };
    assert_eq!(stream_id, "file");
    assert_eq!(byte_count, 4);
    assert!(body.is_empty());
    assert_eq!(&buf[..], b"data");
}

#[rstest]
fn interceptor_takes_raw_bytes_before_next_frame(mut codec: TransportCodec) {
    let collect = Collect::default();
    let mut buf = encode_request(
        &mut codec,
        RequestMessage::Upload(UploadStream {
            request_id: 3,
            meta: ManagedBuffer::from(&b"meta"[..]),
            body_byte_count: 3,
        }),
    );
    buf.extend_from_slice(b"xyz");
    let next = encode_request(
        &mut codec,
        RequestMessage::Stream(StreamRequest {
            stream_id: "after".into(),
        }),
    );
    buf.extend_from_slice(&next);

    let RequestMessage::Upload(upload) = decode_request(&mut codec, &mut buf) else {
        panic!("expected upload");
    };
    assert_eq!(upload.meta.as_slice(), b"meta");
    codec
        .interceptor()
        .install(Box::new(StreamInterceptor::new(
            "upload",
            upload.body_byte_count,
            collect.clone(),
        )))
        .expect("install interceptor");

    let RequestMessage::Stream(req) = decode_request(&mut codec, &mut buf) else {
        panic!("expected stream request after upload body");
    };
    assert_eq!(req.stream_id, "after");
    assert!(!codec.interceptor().is_active());
    let state = collect.0.lock().expect("collect lock");
    assert_eq!(state.0, b"xyz");
    assert!(state.1);
}

#[rstest]
fn pending_interceptor_swallows_partial_body(mut codec: TransportCodec) {
    codec
        .interceptor()
        .install(Box::new(StreamInterceptor::new("upload", 10, Collect::default())))
        .expect("install interceptor");
    let mut buf = BytesMut::from(&b"abc"[..]);
    assert!(codec.decode_eof(&mut buf).expect("decode").is_none());
    assert!(buf.is_empty());
    assert!(codec.interceptor().is_active());
}
