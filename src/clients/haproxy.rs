//! One-shot client for HAProxy's admin socket.
//!
//! Each command opens a fresh connection, writes the command line, closes
//! the write side, and reads the reply until HAProxy closes its side.

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
    time::timeout,
};
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum SocketError {
    #[error("timed out connecting to the admin socket")]
    ConnectTimeout,

    #[error("connecting to the admin socket: {0}")]
    Connect(io::Error),

    #[error("timed out waiting for the command reply")]
    CommandTimeout,

    #[error("admin socket i/o: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, SocketError>;

pub struct HaproxySocket {
    path: PathBuf,
}

impl HaproxySocket {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run one command round-trip and return the raw reply bytes.
    pub async fn command(&self, command: &str) -> Result<Vec<u8>> {
        let mut stream = match timeout(CONNECT_TIMEOUT, UnixStream::connect(&self.path)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(SocketError::Connect(e)),
            Err(_) => return Err(SocketError::ConnectTimeout),
        };

        stream.write_all(command.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        // Half-close so HAProxy sees EOF on the request.
        stream.shutdown().await?;

        let mut reply = Vec::new();
        match timeout(COMMAND_TIMEOUT, stream.read_to_end(&mut reply)).await {
            Ok(Ok(_)) => {
                debug!(command, bytes = reply.len(), "Command reply read");
                Ok(reply)
            }
            Ok(Err(e)) => Err(SocketError::Io(e)),
            Err(_) => Err(SocketError::CommandTimeout),
        }
    }
}
