//! Utilities for driving a `shuffle-transport` server during tests.
//!
//! [`TestClient`] speaks the wire format over any byte stream, including
//! bodies that follow stream response frames. [`spawn_server`] and
//! [`serve_duplex`] run a server over TCP or an in-memory pipe.
//! [`ScriptedHandler`] and [`FixtureStreams`] are collaborators whose
//! behaviour tests choose and whose calls tests inspect.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use bytes::Bytes;
//! use transport_testing::{FixtureStreams, ScriptedHandler, serve_duplex};
//!
//! # async fn example() {
//! let handler = Arc::new(ScriptedHandler::new(Arc::new(FixtureStreams::new())));
//! let (mut client, _server) = serve_duplex(handler, Default::default());
//! let reply = client.rpc(1, Bytes::from_static(b"ping")).await.unwrap();
//! # }
//! ```

pub mod client;
pub mod handler;
pub mod logging;
pub mod server;
pub mod streams;

pub use client::TestClient;
pub use handler::{
    ChannelEvent,
    PushScript,
    RecordedUpload,
    RpcScript,
    ScriptedHandler,
    UploadScript,
};
pub use logging::{LoggerHandle, logger};
pub use server::{ServerHandle, serve_duplex, spawn_server};
pub use streams::{
    CHUNK_STREAM_ID,
    EMPTY_BUFFER,
    FixtureStreams,
    LARGE_BUFFER,
    SMALL_BUFFER,
    fixture_bytes,
};
