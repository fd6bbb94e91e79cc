//! Install orchestration.
//!
//! At most one install runs at a time. A request that lands while one is
//! in flight parks its server set in a single pending slot; later
//! requests overwrite the slot, so only the newest parked set runs. The
//! worker that finishes an install checks the slot and runs once more if
//! something is parked.

use crate::{
    services::generator::{ConfigGenerator, InstallError},
    workers::watch::ServerSet,
};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Installer: Send + Sync {
    async fn install(&self, servers: &ServerSet) -> Result<(), InstallError>;
}

#[async_trait]
impl Installer for ConfigGenerator {
    async fn install(&self, servers: &ServerSet) -> Result<(), InstallError> {
        ConfigGenerator::install(self, servers).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Installed {
    Completed,
    /// Parked behind an in-flight install; the worker finishing that
    /// install picks the newest parked set up.
    Deferred,
}

#[derive(Default)]
struct InstallState {
    busy: bool,
    pending: Option<ServerSet>,
}

pub struct LbManager {
    installer: Box<dyn Installer>,
    state: Mutex<InstallState>,
}

impl LbManager {
    pub fn new(installer: Box<dyn Installer>) -> Self {
        Self { installer, state: Mutex::new(InstallState::default()) }
    }

    pub async fn install(&self, servers: ServerSet) -> Result<Installed, InstallError> {
        {
            let mut state = self.state.lock().await;
            if state.busy {
                debug!("Install already in flight, parking the request");
                state.pending = Some(servers);
                return Ok(Installed::Deferred);
            }
            state.busy = true;
        }

        let mut servers = servers;
        loop {
            let result = self.installer.install(&servers).await;
            let mut state = self.state.lock().await;
            match state.pending.take() {
                Some(next) => {
                    debug!("Running parked install");
                    servers = next;
                }
                None => {
                    state.busy = false;
                    return result.map(|_| Installed::Completed);
                }
            }
        }
    }
}
