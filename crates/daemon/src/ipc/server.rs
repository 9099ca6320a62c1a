//! IPC server side: the listening socket and accepted connections.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::BufReader;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};

use super::messages::{IpcRequest, IpcResponse};
use super::{read_json_line, write_json_line};

/// A server that listens for IPC connections on a Unix Domain Socket.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the server to the specified socket path.
    ///
    /// Parent directories are created as needed and a stale socket file at
    /// the path is replaced.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        tracing::debug!(path = %path.display(), "IPC socket bound");

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept a new incoming connection.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::debug!(path = %self.path.display(), error = %e, "Failed to remove socket file");
            }
        }
    }
}

/// A connection to an IPC client.
pub struct IpcConnection {
    reader: RequestReader,
    writer: ResponseWriter,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: RequestReader {
                inner: BufReader::new(read_half),
            },
            writer: ResponseWriter { inner: write_half },
        }
    }

    /// Read the next request. Returns `None` if the client has disconnected.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        self.reader.read_request().await
    }

    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        self.writer.send_response(response).await
    }

    /// Splits the connection so requests can be read while responses are
    /// pushed from elsewhere.
    pub fn into_split(self) -> (RequestReader, ResponseWriter) {
        (self.reader, self.writer)
    }
}

/// Read half of an [`IpcConnection`].
pub struct RequestReader {
    inner: BufReader<OwnedReadHalf>,
}

impl RequestReader {
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        read_json_line(&mut self.inner).await
    }
}

/// Write half of an [`IpcConnection`].
pub struct ResponseWriter {
    inner: OwnedWriteHalf,
}

impl ResponseWriter {
    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        write_json_line(&mut self.inner, response).await
    }
}

/// Errors that can occur during IPC communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A JSON serialization/deserialization error occurred.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
