//! Serialized access to HAProxy's admin socket.
//!
//! The admin socket does not multiplex: interleaved writers would corrupt
//! each other's commands. Every consumer goes through [`SerialSocket`],
//! which feeds a single worker task running one round-trip at a time in
//! submission order.

use crate::clients::haproxy::{HaproxySocket, SocketError};
use async_trait::async_trait;
use std::io;
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, debug, info_span};

/// The seam reconciliation and metrics depend on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AdminSocket: Send + Sync {
    async fn command(&self, command: &str) -> Result<Vec<u8>, SocketError>;
}

struct CommandRequest {
    command: String,
    reply: oneshot::Sender<Result<Vec<u8>, SocketError>>,
}

pub struct CommandWorker {
    socket: HaproxySocket,
    receiver: mpsc::Receiver<CommandRequest>,
}

impl CommandWorker {
    /// Spawn the worker; the returned handle is the only route to the
    /// socket. The worker exits once every handle is dropped and the
    /// queue has drained.
    pub fn spawn(socket: HaproxySocket) -> SerialSocket {
        let (sender, receiver) = mpsc::channel(64);
        tokio::spawn(async move {
            let worker = CommandWorker { socket, receiver };
            worker.run().instrument(info_span!("command_worker")).await;
        });
        SerialSocket { sender }
    }

    async fn run(mut self) {
        while let Some(request) = self.receiver.recv().await {
            debug!(command = %request.command, "Running admin command");
            let result = self.socket.command(&request.command).await;
            if request.reply.send(result).is_err() {
                debug!("Requester went away before the reply");
            }
        }
        debug!("Exiting run loop");
    }
}

#[derive(Clone)]
pub struct SerialSocket {
    sender: mpsc::Sender<CommandRequest>,
}

#[async_trait]
impl AdminSocket for SerialSocket {
    async fn command(&self, command: &str) -> Result<Vec<u8>, SocketError> {
        let (reply, receiver) = oneshot::channel();
        let request = CommandRequest { command: command.into(), reply };
        if self.sender.send(request).await.is_err() {
            return Err(SocketError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "command worker stopped",
            )));
        }
        receiver.await.map_err(|_| {
            SocketError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "command worker dropped the request"))
        })?
    }
}
