//! Zookeeper session adapter.
//!
//! The watcher depends on the small [`DirectoryClient`] capability set
//! rather than on the zookeeper library directly; [`ZkSession`] implements
//! it over the blocking client, bridging calls through `spawn_blocking`
//! and watch firings onto tokio channels.

use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use zookeeper::{Acl, CreateMode, WatchedEvent, Watcher, ZkError, ZkState, ZooKeeper};

#[derive(Error, Debug)]
pub enum ZkClientError {
    #[error("node does not exist")]
    NoNode,

    #[error("zookeeper operation timed out")]
    PingTimeout,

    #[error("zookeeper session expired")]
    SessionExpired,

    #[error("zookeeper session task stopped")]
    SessionGone,

    #[error("zookeeper: {0:?}")]
    Backend(ZkError),
}

impl From<ZkError> for ZkClientError {
    fn from(e: ZkError) -> Self {
        match e {
            ZkError::NoNode => Self::NoNode,
            ZkError::OperationTimeout | ZkError::ConnectionLoss => Self::PingTimeout,
            ZkError::SessionExpired => Self::SessionExpired,
            e => Self::Backend(e),
        }
    }
}

impl ZkClientError {
    /// Errors that drop a single child from the set instead of tearing the
    /// watcher down.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NoNode | Self::PingTimeout)
    }
}

/// Session-level notifications surfaced to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Lost,
}

/// The capability set the server watcher needs from a directory service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Idempotently create `path` and its ancestors as persistent nodes.
    async fn ensure_path(&self, path: &str) -> Result<(), ZkClientError>;

    /// Current children of `path`. The returned receiver fires once when
    /// the membership next changes; re-arm by calling again.
    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, oneshot::Receiver<()>), ZkClientError>;

    /// Payload of the node at `path`.
    async fn get(&self, path: &str) -> Result<Vec<u8>, ZkClientError>;
}

/// A one-shot zookeeper watch adapter; the library invokes `handle` at
/// most once per registration.
struct FireOnce(std::sync::Mutex<Option<oneshot::Sender<()>>>);

impl FireOnce {
    fn new(sender: oneshot::Sender<()>) -> Self {
        Self(std::sync::Mutex::new(Some(sender)))
    }
}

impl Watcher for FireOnce {
    fn handle(&self, event: WatchedEvent) {
        trace!(?event, "Watch fired");
        if let Ok(mut slot) = self.0.lock() {
            if let Some(sender) = slot.take() {
                let _ = sender.send(());
            }
        }
    }
}

pub struct ZkSession {
    keeper: Arc<ZooKeeper>,
}

impl ZkSession {
    /// One connection attempt; the reconnect policy belongs to the caller.
    pub async fn connect(
        connect_string: &str,
        timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), ZkClientError> {
        let connect = connect_string.to_owned();
        let keeper = tokio::task::spawn_blocking(move || {
            ZooKeeper::connect(&connect, timeout, |_event: WatchedEvent| {})
        })
        .await
        .map_err(|_| ZkClientError::SessionGone)?
        .map_err(ZkClientError::from)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        keeper.add_listener(move |state| match state {
            ZkState::Closed | ZkState::AuthFailed => {
                warn!(?state, "Zookeeper session over");
                let _ = events_tx.send(SessionEvent::Lost);
            }
            ZkState::Connected | ZkState::ConnectedReadOnly => {
                debug!(?state, "Zookeeper session connected");
            }
            state => trace!(?state, "Zookeeper session state change"),
        });

        Ok((Self { keeper: Arc::new(keeper) }, events_rx))
    }

    pub async fn close(&self) {
        let keeper = Arc::clone(&self.keeper);
        let _ = tokio::task::spawn_blocking(move || keeper.close()).await;
    }
}

#[async_trait]
impl DirectoryClient for ZkSession {
    async fn ensure_path(&self, path: &str) -> Result<(), ZkClientError> {
        let keeper = Arc::clone(&self.keeper);
        let path = path.to_owned();
        tokio::task::spawn_blocking(move || {
            let mut prefix = String::new();
            for segment in path.split('/').filter(|s| !s.is_empty()) {
                prefix.push('/');
                prefix.push_str(segment);
                match keeper.create(
                    &prefix,
                    Vec::new(),
                    Acl::open_unsafe().clone(),
                    CreateMode::Persistent,
                ) {
                    Ok(_) => debug!(path = %prefix, "Created directory node"),
                    Err(ZkError::NodeExists) => {}
                    Err(e) => return Err(ZkClientError::from(e)),
                }
            }
            Ok(())
        })
        .await
        .map_err(|_| ZkClientError::SessionGone)?
    }

    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, oneshot::Receiver<()>), ZkClientError> {
        let keeper = Arc::clone(&self.keeper);
        let path = path.to_owned();
        let (tx, rx) = oneshot::channel();
        let children = tokio::task::spawn_blocking(move || {
            keeper.get_children_w(&path, FireOnce::new(tx))
        })
        .await
        .map_err(|_| ZkClientError::SessionGone)?
        .map_err(ZkClientError::from)?;
        Ok((children, rx))
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, ZkClientError> {
        let keeper = Arc::clone(&self.keeper);
        let path = path.to_owned();
        let (data, _stat) = tokio::task::spawn_blocking(move || keeper.get_data(&path, false))
            .await
            .map_err(|_| ZkClientError::SessionGone)?
            .map_err(ZkClientError::from)?;
        Ok(data)
    }
}
