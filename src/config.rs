use anyhow::Context;
use serde::Deserialize;
use std::{
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

/// Stats socket used when `MUPPET_TESTING=1` is set in the environment.
const TESTING_SOCKET_PATH: &str = "/tmp/haproxy.test";

#[derive(Deserialize, Debug)]
pub struct Config {
    /// Service domain whose registered instances this balancer fronts.
    pub domain: String,

    /// Address the trusted (internal) frontends bind to.
    #[serde(rename = "trustedIP")]
    pub trusted_ip: IpAddr,

    /// Addresses for the external, cleartext frontend. May be empty, in
    /// which case the frontend is omitted from the rendered config.
    #[serde(rename = "untrustedIPs", default)]
    pub untrusted_ips: Vec<IpAddr>,

    /// Administrative addresses; the metrics endpoint binds the first one.
    #[serde(rename = "adminIPS", default)]
    pub admin_ips: Vec<IpAddr>,

    /// Addresses on the manta network.
    #[serde(rename = "mantaIPS", default)]
    pub manta_ips: Vec<IpAddr>,

    /// The zookeeper ensemble holding the registration directory.
    pub zookeeper: ZookeeperConfig,

    /// HAProxy integration knobs.
    #[serde(default)]
    pub haproxy: HaproxyConfig,

    /// Port the metrics endpoint listens on.
    #[serde(rename = "metricsPort", default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Default log level, overridable with `-v` on the command line.
    #[serde(rename = "logLevel", default = "default_log_level")]
    pub log_level: String,

    /// Server watcher tuning.
    #[serde(default)]
    pub watch: WatchConfig,
}

#[derive(Deserialize, Debug)]
pub struct ZookeeperConfig {
    pub servers: Vec<ZkServer>,

    /// Session timeout in milliseconds.
    #[serde(default = "default_zk_timeout")]
    pub timeout: u64,
}

#[derive(Deserialize, Debug)]
pub struct ZkServer {
    pub host: String,
    pub port: u16,
}

#[derive(Deserialize, Debug)]
pub struct HaproxyConfig {
    /// Worker threads written into the rendered config.
    #[serde(default = "default_nbthread")]
    pub nbthread: u32,

    /// Where the live configuration file is installed.
    #[serde(rename = "configPath", default = "default_config_path")]
    pub config_path: PathBuf,

    /// Admin (stats) socket path.
    #[serde(rename = "socketPath", default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Command that tells the service manager to pick up a new config.
    #[serde(rename = "refreshCommand", default = "default_refresh_command")]
    pub refresh_command: String,

    /// Service instance whose manifest names the haproxy binary.
    #[serde(rename = "serviceFmri", default = "default_service_fmri")]
    pub service_fmri: String,

    /// Explicit haproxy binary, bypassing manifest discovery.
    #[serde(rename = "execPath", default)]
    pub exec_path: Option<PathBuf>,
}

impl Default for HaproxyConfig {
    fn default() -> Self {
        Self {
            nbthread: default_nbthread(),
            config_path: default_config_path(),
            socket_path: default_socket_path(),
            refresh_command: default_refresh_command(),
            service_fmri: default_service_fmri(),
            exec_path: None,
        }
    }
}

impl HaproxyConfig {
    /// The admin socket to use, honoring the `MUPPET_TESTING` switch.
    pub fn admin_socket_path(&self) -> PathBuf {
        let testing = std::env::var("MUPPET_TESTING").map(|v| v == "1").unwrap_or(false);
        self.admin_socket_path_for(testing)
    }

    fn admin_socket_path_for(&self, testing: bool) -> PathBuf {
        if testing { PathBuf::from(TESTING_SOCKET_PATH) } else { self.socket_path.clone() }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct WatchConfig {
    /// Window over which bursts of child notifications are folded into a
    /// single evaluation.
    #[serde(
        rename = "collectionTimeout",
        with = "humantime_serde",
        default = "default_collection_timeout"
    )]
    pub collection_timeout: Duration,

    /// How long a disappeared child is held before its removal is applied.
    #[serde(rename = "smearTime", with = "humantime_serde", default = "default_smear_time")]
    pub smear_time: Duration,

    /// Largest fraction of the membership a single emission may remove.
    #[serde(rename = "removalThreshold", default = "default_removal_threshold")]
    pub removal_threshold: f64,

    /// Concurrent payload fetches per notification; 0 means one per child.
    #[serde(rename = "fetchConcurrency", default)]
    pub fetch_concurrency: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            collection_timeout: default_collection_timeout(),
            smear_time: default_smear_time(),
            removal_threshold: default_removal_threshold(),
            fetch_concurrency: 0,
        }
    }
}

impl ZookeeperConfig {
    pub fn connect_string(&self) -> String {
        self.servers.iter().map(|s| format!("{}:{}", s.host, s.port)).collect::<Vec<_>>().join(",")
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }
}

fn default_metrics_port() -> u16 {
    8881
}

fn default_log_level() -> String {
    "info".into()
}

fn default_zk_timeout() -> u64 {
    30000
}

fn default_nbthread() -> u32 {
    4
}

fn default_config_path() -> PathBuf {
    "/opt/smartdc/muppet/etc/haproxy.cfg".into()
}

fn default_socket_path() -> PathBuf {
    "/tmp/haproxy".into()
}

fn default_refresh_command() -> String {
    "svcadm refresh haproxy".into()
}

fn default_service_fmri() -> String {
    "haproxy".into()
}

fn default_collection_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_smear_time() -> Duration {
    Duration::from_secs(60)
}

fn default_removal_threshold() -> f64 {
    0.5
}
