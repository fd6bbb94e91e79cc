//! Server watcher.
//!
//! Watches the registration directory for the configured domain and emits
//! a canonical server set whenever the observed membership actually
//! changes. Notifications arrive in bursts during rolling deploys, so the
//! watcher folds everything seen inside a collection window into one
//! evaluation, resolves payloads with bounded concurrency, and holds
//! removals back (smearing) so a transient session blip cannot empty the
//! balancer.

use crate::{
    clients::zookeeper::{DirectoryClient, ZkClientError},
    config::WatchConfig,
};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{
    sync::{Semaphore, oneshot, watch},
    task::{JoinHandle, JoinSet},
};
use tracing::{Instrument, debug, info, info_span, trace, warn};

/// A backend instance registered under the service directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub id: String,
    pub kind: String,
    pub address: String,
    pub enabled: bool,
}

/// The canonical server set: one entry per registration id, id-sorted.
pub type ServerSet = BTreeMap<String, Backend>;

const DEFAULT_KIND: &str = "webapi";

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("zookeeper: {0}")]
    Zk(#[from] ZkClientError),
}

#[derive(Debug, Clone)]
pub struct WatchTuning {
    pub collection_timeout: Duration,
    pub smear_time: Duration,
    pub removal_threshold: f64,
    pub fetch_concurrency: usize,
}

impl From<&WatchConfig> for WatchTuning {
    fn from(config: &WatchConfig) -> Self {
        Self {
            collection_timeout: config.collection_timeout,
            smear_time: config.smear_time,
            removal_threshold: config.removal_threshold,
            fetch_concurrency: config.fetch_concurrency,
        }
    }
}

/// Registration directory path for a service domain:
/// `manta.example.com` becomes `/com/example/manta`.
pub fn registry_path(domain: &str) -> String {
    let mut path = String::new();
    for part in domain.split('.').rev().filter(|p| !p.is_empty()) {
        path.push('/');
        path.push_str(part);
    }
    path
}

#[derive(Deserialize)]
struct RegistrationPayload {
    #[serde(rename = "type")]
    node_type: String,

    #[serde(default)]
    kind: Option<String>,

    #[serde(default = "default_enabled")]
    enabled: bool,

    #[serde(default)]
    host: Option<HostPayload>,
}

#[derive(Deserialize)]
struct HostPayload {
    address: String,
}

fn default_enabled() -> bool {
    true
}

enum Resolved {
    Host(Backend),
    /// Other registration types share the directory and are not ours.
    Ignored,
}

fn decode_payload(id: &str, payload: &[u8]) -> Result<Resolved, serde_json::Error> {
    let payload: RegistrationPayload = serde_json::from_slice(payload)?;
    if payload.node_type != "host" {
        return Ok(Resolved::Ignored);
    }
    let Some(host) = payload.host else {
        return Err(serde::de::Error::custom("host registration without an address"));
    };
    Ok(Resolved::Host(Backend {
        id: id.to_string(),
        kind: payload.kind.unwrap_or_else(|| DEFAULT_KIND.to_string()),
        address: host.address,
        enabled: payload.enabled,
    }))
}

pub struct WatcherHandle {
    pub join: JoinHandle<Result<(), WatchError>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl WatcherHandle {
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

enum WindowOutcome {
    Children(Vec<String>),
    Shutdown,
}

pub struct ServerWatcher {
    client: Arc<dyn DirectoryClient>,
    path: String,
    tuning: WatchTuning,
    sets: watch::Sender<ServerSet>,
    /// Resolved membership, including staged removals still being held.
    members: ServerSet,
    /// Disappeared children and when their removal was staged.
    staged: BTreeMap<String, Instant>,
    /// Set when a release pass was cut short by the removal budget.
    throttled_until: Option<Instant>,
    emitted: Option<ServerSet>,
}

impl ServerWatcher {
    pub fn spawn(
        client: Arc<dyn DirectoryClient>,
        domain: &str,
        tuning: WatchTuning,
    ) -> (WatcherHandle, watch::Receiver<ServerSet>) {
        let (sets_tx, sets_rx) = watch::channel(ServerSet::new());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let path = registry_path(domain);
        let span = info_span!("server_watcher", path = %path);
        let watcher = ServerWatcher {
            client,
            path,
            tuning,
            sets: sets_tx,
            members: ServerSet::new(),
            staged: BTreeMap::new(),
            throttled_until: None,
            emitted: None,
        };
        let join = tokio::spawn(watcher.run(shutdown_rx).instrument(span));
        (WatcherHandle { join, shutdown: Some(shutdown_tx) }, sets_rx)
    }

    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> Result<(), WatchError> {
        self.client.ensure_path(&self.path).await?;
        info!("Watching registration directory");

        // The initial enumeration counts as the first notification.
        let (children, mut changed) = self.client.watch_children(&self.path).await?;
        let mut pending = Some(children);

        loop {
            let notified = match pending.take() {
                Some(children) => Some(children),
                None => {
                    tokio::select! {
                        _ = &mut shutdown => {
                            info!("Watcher shutting down");
                            return Ok(());
                        }
                        _ = &mut changed => {
                            let (children, next) = self.client.watch_children(&self.path).await?;
                            changed = next;
                            Some(children)
                        }
                        _ = Self::sleep_until(self.next_release()) => None,
                    }
                }
            };

            let resolved = match notified {
                Some(first) => {
                    match self.collect_window(first, &mut changed, &mut shutdown).await? {
                        WindowOutcome::Shutdown => {
                            info!("Watcher shutting down");
                            return Ok(());
                        }
                        WindowOutcome::Children(children) => Some(self.resolve(children).await?),
                    }
                }
                None => None,
            };

            self.apply(resolved);
            self.emit();
        }
    }

    /// Fold every notification that lands inside one collection window;
    /// the newest observation wins.
    async fn collect_window(
        &self,
        first: Vec<String>,
        changed: &mut oneshot::Receiver<()>,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Result<WindowOutcome, WatchError> {
        let mut latest = first;
        let deadline = tokio::time::Instant::now() + self.tuning.collection_timeout;
        loop {
            tokio::select! {
                _ = &mut *shutdown => return Ok(WindowOutcome::Shutdown),
                _ = &mut *changed => {
                    let (children, next) = self.client.watch_children(&self.path).await?;
                    *changed = next;
                    trace!(children = children.len(), "Folding notification into the open window");
                    latest = children;
                }
                _ = tokio::time::sleep_until(deadline) => return Ok(WindowOutcome::Children(latest)),
            }
        }
    }

    /// Fetch and decode every child's payload with bounded concurrency.
    async fn resolve(&self, children: Vec<String>) -> Result<ServerSet, WatchError> {
        let limit = match self.tuning.fetch_concurrency {
            0 => children.len().max(1),
            n => n,
        };
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut fetches = JoinSet::new();
        for id in children {
            let client = Arc::clone(&self.client);
            let path = format!("{}/{}", self.path, id);
            let semaphore = Arc::clone(&semaphore);
            fetches.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let payload = client.get(&path).await;
                (id, payload)
            });
        }

        let mut set = ServerSet::new();
        while let Some(joined) = fetches.join_next().await {
            let Ok((id, payload)) = joined else {
                warn!("Payload fetch task failed to join");
                continue;
            };
            match payload {
                Ok(payload) => match decode_payload(&id, &payload) {
                    Ok(Resolved::Host(backend)) => {
                        set.insert(id, backend);
                    }
                    Ok(Resolved::Ignored) => {
                        trace!(child = %id, "Ignoring non-host registration");
                    }
                    Err(e) => {
                        warn!(child = %id, error = %e, "Malformed registration payload, dropping child");
                    }
                },
                Err(ZkClientError::NoNode) => {
                    debug!(child = %id, "Registration disappeared mid-fetch");
                }
                Err(e) if e.is_transient() => {
                    warn!(child = %id, error = %e, "Transient fetch failure, dropping child");
                }
                Err(e) => return Err(WatchError::Zk(e)),
            }
        }
        Ok(set)
    }

    /// Fold a resolved snapshot into the membership: arrivals and updates
    /// apply immediately, disappearances are staged, and staged removals
    /// are released according to hold time and removal budget.
    fn apply(&mut self, resolved: Option<ServerSet>) {
        let now = Instant::now();
        if let Some(resolved) = resolved {
            for (id, backend) in &resolved {
                self.staged.remove(id);
                self.members.insert(id.clone(), backend.clone());
            }
            let gone: Vec<String> =
                self.members.keys().filter(|id| !resolved.contains_key(*id)).cloned().collect();
            for id in gone {
                debug!(child = %id, "Staging removal");
                self.staged.entry(id).or_insert(now);
            }
        }
        self.release_staged(now);
    }

    fn release_staged(&mut self, now: Instant) {
        loop {
            let mut due: Vec<(String, Instant)> = self
                .staged
                .iter()
                .filter(|(_, staged_at)| now.duration_since(**staged_at) >= self.tuning.smear_time)
                .map(|(id, staged_at)| (id.clone(), *staged_at))
                .collect();
            if due.is_empty() {
                if self.staged.is_empty() {
                    self.throttled_until = None;
                }
                return;
            }
            due.sort_by_key(|(_, staged_at)| *staged_at);

            let budget = removal_budget(self.members.len(), self.tuning.removal_threshold);
            let releasing = due.len().min(budget);
            let truncated = releasing < due.len();
            for (id, _) in due.drain(..releasing) {
                debug!(child = %id, "Removal released");
                self.staged.remove(&id);
                self.members.remove(&id);
            }

            if !truncated {
                if self.staged.is_empty() {
                    self.throttled_until = None;
                }
                return;
            }
            if self.tuning.smear_time.is_zero() {
                // Nothing is being held; drain fully in one evaluation.
                continue;
            }
            self.throttled_until = Some(now + self.tuning.smear_time);
            return;
        }
    }

    fn next_release(&self) -> Option<Instant> {
        let earliest = self.staged.values().min()?;
        let mut wake = *earliest + self.tuning.smear_time;
        if let Some(throttled) = self.throttled_until {
            wake = wake.max(throttled);
        }
        Some(wake)
    }

    async fn sleep_until(wake: Option<Instant>) {
        match wake {
            Some(wake) => tokio::time::sleep_until(tokio::time::Instant::from_std(wake)).await,
            None => std::future::pending().await,
        }
    }

    fn emit(&mut self) {
        if self.emitted.as_ref() == Some(&self.members) {
            trace!("No changes in the server set");
            return;
        }
        debug!(servers = self.members.len(), "Server set changed");
        self.emitted = Some(self.members.clone());
        if self.sets.send(self.members.clone()).is_err() {
            // The supervisor went away; shutdown follows.
            debug!("No listener for the server set");
        }
    }
}

/// Largest number of members one emission may drop. Always at least one so
/// a fully-held set can still drain after its hold time.
fn removal_budget(membership: usize, threshold: f64) -> usize {
    (((membership as f64) * threshold).floor() as usize).max(1)
}
