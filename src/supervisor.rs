//! Top-level lifecycle.
//!
//! The supervisor owns the zookeeper session and the single watcher
//! attached to it. It connects with exponential backoff, reconciles on
//! every emitted server set, and tears the whole stack down and
//! reconnects when the session goes away or reconciliation discovers the
//! desired set and config file have drifted apart.

use crate::{
    clients::zookeeper::{DirectoryClient, SessionEvent, ZkSession},
    config::Config,
    reconcile::{self, ReconcileError},
    services::{generator::InstallError, manager::LbManager},
    stats::SHOW_STAT_SERVERS,
    workers::{
        socket::AdminSocket,
        watch::{ServerSet, ServerWatcher, WatchTuning, WatcherHandle},
    },
};
use std::{sync::Arc, time::Duration};
use strum::EnumDiscriminants;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Install(#[from] InstallError),
}

impl SyncError {
    /// Drift between the desired set and the config file cannot be fixed
    /// in place; the supervisor restarts from a fresh session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Reconcile(ReconcileError::UnmappedServer { .. }))
    }
}

#[derive(EnumDiscriminants)]
enum State {
    Connecting,
    Running(Session),
    Stopping,
}

struct Session {
    client: Arc<ZkSession>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    watcher: WatcherHandle,
    sets: watch::Receiver<ServerSet>,
}

struct Shutdown {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
}

impl Shutdown {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self { sigint: signal(SignalKind::interrupt())?, sigterm: signal(SignalKind::terminate())? })
    }

    async fn recv(&mut self) {
        tokio::select! {
            _ = self.sigint.recv() => {}
            _ = self.sigterm.recv() => {}
        }
    }
}

pub struct Supervisor {
    config: Config,
    socket: Arc<dyn AdminSocket>,
    manager: Arc<LbManager>,
    tuning: WatchTuning,
    shutdown: Shutdown,
}

impl Supervisor {
    pub fn new(
        config: Config,
        socket: Arc<dyn AdminSocket>,
        manager: Arc<LbManager>,
    ) -> anyhow::Result<Self> {
        let tuning = WatchTuning::from(&config.watch);
        let shutdown = Shutdown::new()?;
        Ok(Self { config, socket, manager, tuning, shutdown })
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut state = State::Connecting;
        loop {
            debug!(state = ?StateDiscriminants::from(&state), "Entering state");
            state = match state {
                State::Connecting => self.connect().await,
                State::Running(session) => self.running(session).await,
                State::Stopping => break,
            };
        }
        info!("Supervisor stopped");
        Ok(())
    }

    /// Open a session and attach the watcher, backing off exponentially
    /// for as long as it takes.
    async fn connect(&mut self) -> State {
        let connect_string = self.config.zookeeper.connect_string();
        let session_timeout = self.config.zookeeper.session_timeout();
        let mut delay = BACKOFF_INITIAL;
        loop {
            info!(servers = %connect_string, "Connecting to zookeeper");
            let attempt = tokio::select! {
                _ = self.shutdown.recv() => return State::Stopping,
                attempt = ZkSession::connect(&connect_string, session_timeout) => attempt,
            };
            match attempt {
                Ok((session, events)) => {
                    let client = Arc::new(session);
                    let (watcher, sets) = ServerWatcher::spawn(
                        Arc::clone(&client) as Arc<dyn DirectoryClient>,
                        &self.config.domain,
                        self.tuning.clone(),
                    );
                    info!("Session established, watcher attached");
                    return State::Running(Session { client, events, watcher, sets });
                }
                Err(e) => {
                    warn!(error = %e, delay = ?delay, "Connect failed, backing off");
                    tokio::select! {
                        _ = self.shutdown.recv() => return State::Stopping,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = next_backoff(delay);
                }
            }
        }
    }

    async fn running(&mut self, mut session: Session) -> State {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    self.teardown(session).await;
                    return State::Stopping;
                }
                changed = session.sets.changed() => {
                    if changed.is_err() {
                        // The watcher is gone; its join result says why.
                        self.teardown(session).await;
                        return State::Connecting;
                    }
                    let servers = session.sets.borrow_and_update().clone();
                    match self.reconcile(&servers).await {
                        Ok(()) => {}
                        Err(e) if e.is_fatal() => {
                            error!(error = %e, "Fatal reconcile failure, restarting");
                            self.teardown(session).await;
                            return State::Connecting;
                        }
                        Err(e) => warn!(error = %e, "Reconcile failed, waiting for the next change"),
                    }
                }
                event = session.events.recv() => {
                    warn!(?event, "Zookeeper session lost, restarting");
                    self.teardown(session).await;
                    return State::Connecting;
                }
                joined = &mut session.watcher.join => {
                    match joined {
                        Ok(Ok(())) => info!("Watcher stopped"),
                        Ok(Err(e)) => error!(error = %e, "Watcher failed"),
                        Err(e) => error!(error = %e, "Watcher task died"),
                    }
                    session.client.close().await;
                    return State::Connecting;
                }
            }
        }
    }

    /// One reconcile pass for an emitted server set: decide between the
    /// config rewrite and the socket-only path.
    async fn reconcile(&self, servers: &ServerSet) -> Result<(), SyncError> {
        debug!(servers = servers.len(), "Reconciling");
        let rows = reconcile::query_stats(self.socket.as_ref(), SHOW_STAT_SERVERS).await?;
        let check = reconcile::check_stats(servers, &rows);
        for wrong in &check.wrong {
            debug!(pool = %wrong.pxname, server = %wrong.svname, reason = %wrong.reason, "Divergent server");
        }
        if check.reload {
            info!("Topology diverged, rewriting the config");
            self.manager.install(servers.clone()).await?;
        } else {
            reconcile::sync_server_state(servers, self.socket.as_ref()).await?;
        }
        Ok(())
    }

    /// Stop the watcher, let in-flight work finish, close the session.
    async fn teardown(&self, session: Session) {
        let Session { client, mut watcher, .. } = session;
        watcher.stop();
        match (&mut watcher.join).await {
            Ok(Ok(())) => debug!("Watcher drained"),
            Ok(Err(e)) => warn!(error = %e, "Watcher ended with an error"),
            Err(e) => warn!(error = %e, "Watcher task died"),
        }
        client.close().await;
    }
}

fn next_backoff(delay: Duration) -> Duration {
    (delay * 2).min(BACKOFF_MAX)
}
