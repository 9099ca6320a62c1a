//! Unix Domain Socket IPC between the CLI and the daemon.
//!
//! Every message is a single JSON object followed by a newline. A connection
//! is request/response until it sends `Attach`; after that the daemon also
//! pushes `Event` responses for the attached room, and the client may keep
//! sending requests (typically `SendInput`) on the same connection.
//!
//! ## Socket Path
//!
//! - Primary: `$XDG_RUNTIME_DIR/termrooms/daemon.sock`
//! - Fallback: `/tmp/termrooms-$UID/daemon.sock`

mod client;
mod messages;
mod server;

pub use client::{ClientReader, ClientWriter, IpcClient};
pub use messages::{IpcErrorKind, IpcRequest, IpcResponse};
pub use server::{IpcConnection, IpcError, IpcServer, RequestReader, ResponseWriter};

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Get the socket path for IPC communication.
#[cfg(unix)]
pub fn get_socket_path() -> PathBuf {
    use std::os::unix::fs::MetadataExt;

    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir)
            .join("termrooms")
            .join("daemon.sock")
    } else {
        let uid = std::fs::metadata("/proc/self")
            .map(|m| m.uid())
            .unwrap_or(0);

        PathBuf::from(format!("/tmp/termrooms-{}", uid)).join("daemon.sock")
    }
}

/// Non-Unix platforms are not supported for Unix Domain Sockets.
#[cfg(not(unix))]
pub fn get_socket_path() -> PathBuf {
    PathBuf::from("/tmp/termrooms-unsupported/daemon.sock")
}

/// Reads one JSON line. `Ok(None)` means the peer closed the connection.
async fn read_json_line<R, T>(reader: &mut R) -> Result<Option<T>, IpcError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            return Ok(None);
        }
        // Tolerate blank keep-alive lines.
        if !line.trim().is_empty() {
            break;
        }
    }

    Ok(Some(serde_json::from_str(line.trim())?))
}

/// Writes `message` as one JSON line and flushes.
async fn write_json_line<W, T>(writer: &mut W, message: &T) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut json = serde_json::to_string(message)?;
    json.push('\n');

    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
