//! IPC client for talking to the daemon over its Unix socket.

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use super::messages::{IpcRequest, IpcResponse};
use super::server::IpcError;
use super::{read_json_line, write_json_line};
use crate::session::{DriverParams, SessionId};

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// A client for communicating with the daemon via IPC.
///
/// [`IpcClient::send`] pairs one request with the next response. Once a
/// connection is attached, responses and room events interleave; use
/// [`IpcClient::into_split`] and read them as they come.
pub struct IpcClient {
    reader: ClientReader,
    writer: ClientWriter,
    timeout: Duration,
}

fn timed_out(what: &str) -> IpcError {
    IpcError::Io(io::Error::new(io::ErrorKind::TimedOut, what.to_string()))
}

impl IpcClient {
    /// Connect to the daemon at the specified socket path.
    ///
    /// An error here typically means the daemon is not running.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::from_stream(stream, Duration::from_secs(DEFAULT_TIMEOUT_SECS)))
    }

    /// Connect to the daemon, giving up after `timeout`. The same timeout
    /// applies to later requests.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| timed_out("connection timed out"))??;

        Ok(Self::from_stream(stream, timeout))
    }

    fn from_stream(stream: UnixStream, timeout: Duration) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: ClientReader {
                inner: BufReader::new(read_half),
            },
            writer: ClientWriter { inner: write_half },
            timeout,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send a request and wait for its response.
    pub async fn send(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        tokio::time::timeout(self.timeout, self.send_internal(request))
            .await
            .map_err(|_| timed_out("operation timed out"))?
    }

    async fn send_internal(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        self.writer.send_request(&request).await?;

        match self.reader.next_response().await? {
            Some(response) => Ok(response),
            None => Err(IpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "daemon closed connection",
            ))),
        }
    }

    /// Write a request without waiting for anything.
    pub async fn send_request(&mut self, request: &IpcRequest) -> Result<(), IpcError> {
        self.writer.send_request(request).await
    }

    /// Wait (without a timeout) for the next response or event.
    pub async fn next_response(&mut self) -> Result<Option<IpcResponse>, IpcError> {
        self.reader.next_response().await
    }

    pub fn into_split(self) -> (ClientReader, ClientWriter) {
        (self.reader, self.writer)
    }

    /// Check that the daemon responds with `Pong`.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let response = self.send(IpcRequest::Ping).await?;
        Ok(matches!(response, IpcResponse::Pong))
    }

    pub async fn status(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Status).await
    }

    pub async fn stop(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Stop).await
    }

    pub async fn list_sessions(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::ListSessions).await
    }

    pub async fn start_session(
        &mut self,
        session_id: SessionId,
        params: DriverParams,
    ) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::StartSession { session_id, params }).await
    }

    pub async fn send_input(
        &mut self,
        session_id: SessionId,
        text: String,
    ) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::SendInput { session_id, text }).await
    }

    pub async fn history(&mut self, session_id: SessionId) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::GetHistory { session_id }).await
    }
}

/// Read half of an [`IpcClient`].
pub struct ClientReader {
    inner: BufReader<OwnedReadHalf>,
}

impl ClientReader {
    /// `Ok(None)` once the daemon closes the connection.
    pub async fn next_response(&mut self) -> Result<Option<IpcResponse>, IpcError> {
        read_json_line(&mut self.inner).await
    }
}

/// Write half of an [`IpcClient`].
pub struct ClientWriter {
    inner: OwnedWriteHalf,
}

impl ClientWriter {
    pub async fn send_request(&mut self, request: &IpcRequest) -> Result<(), IpcError> {
        write_json_line(&mut self.inner, request).await
    }
}
