//! Directory-backed handler for the `shuffle-transport` binary.
//!
//! Every regular file beneath the root is a stream named by its relative
//! path. An RPC whose body is such a name is answered with the file size as
//! a big-endian `u64`.

use std::{
    fs,
    io,
    path::{Component, Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use log::{debug, info};
use shuffle_transport::{
    BoxError,
    ManagedBuffer,
    RpcHandler,
    RpcResponseCallback,
    StreamManager,
    TransportClient,
    TransportError,
};
use thiserror::Error;

/// Reasons a stream name cannot be served.
#[derive(Debug, Error)]
pub enum FileError {
    /// The name is not a relative path beneath the root.
    #[error("stream name escapes the served directory: {name}")]
    Escapes {
        /// Name supplied by the client.
        name: String,
    },
    /// The name is not valid UTF-8.
    #[error("stream name is not valid utf-8")]
    InvalidName,
}

/// Serves files beneath `root` as streams.
pub struct DirectoryHandler {
    streams: Arc<DirectoryStreams>,
}

impl DirectoryHandler {
    /// Serve files beneath `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if `root` cannot be resolved.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = fs::canonicalize(root)?;
        info!("serving directory: root={}", root.display());
        Ok(Self {
            streams: Arc::new(DirectoryStreams {
                root,
                in_flight: AtomicU64::new(0),
            }),
        })
    }
}

impl RpcHandler for DirectoryHandler {
    fn receive(
        &self,
        _client: &TransportClient,
        message: Bytes,
        callback: Arc<dyn RpcResponseCallback>,
    ) -> Result<(), BoxError> {
        let name = std::str::from_utf8(&message).map_err(|_| FileError::InvalidName)?;
        let path = self.streams.resolve(name)?;
        let len = fs::metadata(path)?.len();
        callback.on_success(Bytes::copy_from_slice(&len.to_be_bytes()));
        Ok(())
    }

    fn stream_manager(&self) -> Arc<dyn StreamManager> { self.streams.clone() }
}

struct DirectoryStreams {
    root: PathBuf,
    in_flight: AtomicU64,
}

impl DirectoryStreams {
    fn resolve(&self, name: &str) -> Result<PathBuf, FileError> {
        let relative = Path::new(name);
        let escapes = || FileError::Escapes {
            name: name.to_owned(),
        };
        if name.is_empty()
            || !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(escapes());
        }
        Ok(self.root.join(relative))
    }
}

impl StreamManager for DirectoryStreams {
    fn get_chunk(&self, stream_id: u64, _chunk_index: u32) -> Result<ManagedBuffer, BoxError> {
        Err(Box::new(TransportError::UnknownStream { stream_id }))
    }

    fn open_stream(&self, stream_id: &str) -> Result<Option<ManagedBuffer>, BoxError> {
        let path = self.resolve(stream_id)?;
        match fs::read(&path) {
            Ok(data) => {
                debug!("opened stream: stream_id={stream_id}, bytes={}", data.len());
                Ok(Some(ManagedBuffer::from(data)))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Box::new(e)),
        }
    }

    fn chunks_being_transferred(&self) -> u64 { self.in_flight.load(Ordering::SeqCst) }

    fn stream_being_sent(&self, _stream_id: &str) { self.in_flight.fetch_add(1, Ordering::SeqCst); }

    fn stream_sent(&self, _stream_id: &str) { self.in_flight.fetch_sub(1, Ordering::SeqCst); }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;

    #[fixture]
    fn served() -> (TempDir, DirectoryHandler) {
        let dir = TempDir::new().expect("create temp dir");
        fs::create_dir(dir.path().join("shuffle-0")).expect("create subdir");
        fs::write(dir.path().join("shuffle-0/part-1"), b"partition bytes").expect("write file");
        let handler = DirectoryHandler::new(dir.path()).expect("serve temp dir");
        (dir, handler)
    }

    #[rstest]
    fn opens_files_beneath_root(served: (TempDir, DirectoryHandler)) {
        let (_dir, handler) = served;
        let buf = handler
            .stream_manager()
            .open_stream("shuffle-0/part-1")
            .expect("open")
            .expect("present");
        assert_eq!(buf.as_slice(), b"partition bytes");
    }

    #[rstest]
    fn missing_file_is_not_found(served: (TempDir, DirectoryHandler)) {
        let (_dir, handler) = served;
        let opened = handler
            .stream_manager()
            .open_stream("shuffle-0/absent")
            .expect("open");
        assert!(opened.is_none());
    }

    #[rstest]
    #[case("../etc/passwd")]
    #[case("/etc/passwd")]
    #[case("shuffle-0/../../secret")]
    #[case("")]
    fn rejects_names_escaping_root(served: (TempDir, DirectoryHandler), #[case] name: &str) {
        let (_dir, handler) = served;
        let err = handler
            .stream_manager()
            .open_stream(name)
            .expect_err("escape rejected");
        assert!(err.to_string().contains("escapes the served directory"));
    }

    #[rstest]
    fn stream_bookkeeping_counts_in_flight(served: (TempDir, DirectoryHandler)) {
        let (_dir, handler) = served;
        let streams = handler.stream_manager();
        streams.stream_being_sent("shuffle-0/part-1");
        assert_eq!(streams.chunks_being_transferred(), 1);
        streams.stream_sent("shuffle-0/part-1");
        assert_eq!(streams.chunks_being_transferred(), 0);
    }
}
