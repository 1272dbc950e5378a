#![doc(html_root_url = "https://docs.rs/shuffle-transport/latest")]
//! Server-side request dispatch for a shuffle data transport.
//!
//! A [`TransportServer`] accepts TCP connections and serves each one with a
//! [`RequestDispatcher`]. The dispatcher decodes framed requests, applies
//! worker registration and chunk backpressure checks, routes work to the
//! business [`RpcHandler`] and writes at most one reply per request.
//! Upload bodies are consumed directly from the connection through a
//! [`FrameInterceptor`] before ordinary frame decoding resumes.

pub mod buffer;
pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod interceptor;
pub mod panic;
pub mod protocol;
pub mod response;
pub mod server;
pub mod session;
pub mod stream_manager;

pub use buffer::{BufferTracker, ManagedBuffer};
pub use channel::{Channel, TransportClient};
pub use codec::{CodecError, FramingError, TransportCodec};
pub use config::TransportConf;
pub use dispatcher::RequestDispatcher;
pub use error::{BoxError, SharedError, TransportError, error_detail};
pub use handler::{
    OneWayRpcCallback,
    RpcHandler,
    RpcResponseCallback,
    StreamCallback,
    StreamCallbackWithId,
};
pub use interceptor::{Feed, FrameInterceptor, InterceptorSlot, StreamInterceptor};
pub use protocol::{
    ChunkFetchRequest,
    Message,
    MessageType,
    OneWayMessage,
    PushData,
    PushMergedData,
    RequestMessage,
    ResponseMessage,
    RpcRequest,
    StreamChunkId,
    StreamRequest,
    UploadStream,
};
pub use response::{ResponseWriter, WriteCompletion};
pub use server::{ServerError, TransportServer};
pub use session::ConnectionId;
pub use stream_manager::{OneForOneStreamManager, StreamManager};
