//! HAProxy configuration generation and installation.
//!
//! Rendering substitutes the canonical server set into the bundled
//! template. Installation never touches the live config without proof:
//! write to `<cfg>.tmp`, have haproxy dry-run check it, atomically rename
//! into place, then tell the service manager to refresh.

use crate::workers::watch::ServerSet;
use anyhow::{Context as _, anyhow, bail};
use serde::Serialize;
use std::{
    io,
    net::IpAddr,
    path::{Path, PathBuf},
};
use tera::{Context, Tera};
use thiserror::Error;
use tokio::{fs, process::Command};
use tracing::{debug, info};

const CONFIG_TEMPLATE: &str = include_str!("../templates/haproxy.cfg.j2");

/// Ports the secure and cleartext pools listen on per backend host.
const SECURE_PORT: u16 = 80;
const CLEAR_PORT: u16 = 81;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("no hosts are registered, refusing to render an empty pool")]
    NoHosts,

    #[error("config template: {0}")]
    Template(#[from] tera::Error),
}

#[derive(Error, Debug)]
pub enum InstallError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("writing {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("spawning the config check: {0}")]
    Check(io::Error),

    #[error("config check failed, temp file kept at {path}: {stderr}")]
    CheckFailed { path: PathBuf, stderr: String },

    #[error("installing the config: {0}")]
    Rename(io::Error),

    #[error("spawning the refresh command: {0}")]
    Refresh(io::Error),

    #[error("refresh command failed: {stderr}")]
    RefreshFailed { stderr: String },
}

#[derive(Serialize, Debug, PartialEq, Eq)]
struct ServerEntry {
    name: String,
    address: String,
}

#[derive(Serialize)]
struct TemplateInput {
    hostname: String,
    nbthread: u32,
    trusted_ip: String,
    untrusted_ips: Vec<String>,
    socket_path: String,
    secure_servers: Vec<ServerEntry>,
    insecure_servers: Vec<ServerEntry>,
}

pub struct GeneratorArgs {
    pub hostname: String,
    pub nbthread: u32,
    pub trusted_ip: IpAddr,
    pub untrusted_ips: Vec<IpAddr>,
    pub config_path: PathBuf,
    pub socket_path: PathBuf,
    pub haproxy_exec: PathBuf,
    pub refresh_command: String,
}

pub struct ConfigGenerator {
    hostname: String,
    nbthread: u32,
    trusted_ip: IpAddr,
    untrusted_ips: Vec<IpAddr>,
    config_path: PathBuf,
    socket_path: PathBuf,
    haproxy_exec: PathBuf,
    refresh_command: String,
}

impl ConfigGenerator {
    pub fn new(args: GeneratorArgs) -> Self {
        let GeneratorArgs {
            hostname,
            nbthread,
            trusted_ip,
            untrusted_ips,
            config_path,
            socket_path,
            haproxy_exec,
            refresh_command,
        } = args;
        Self {
            hostname,
            nbthread,
            trusted_ip,
            untrusted_ips,
            config_path,
            socket_path,
            haproxy_exec,
            refresh_command,
        }
    }

    pub fn render(&self, servers: &ServerSet) -> Result<String, RenderError> {
        if servers.is_empty() {
            return Err(RenderError::NoHosts);
        }
        let input = TemplateInput {
            hostname: self.hostname.clone(),
            nbthread: self.nbthread,
            trusted_ip: self.trusted_ip.to_string(),
            untrusted_ips: self.untrusted_ips.iter().map(IpAddr::to_string).collect(),
            socket_path: self.socket_path.display().to_string(),
            secure_servers: server_entries(servers, SECURE_PORT),
            insecure_servers: server_entries(servers, CLEAR_PORT),
        };
        let context = Context::from_serialize(&input).map_err(RenderError::Template)?;
        Ok(Tera::one_off(CONFIG_TEMPLATE, &context, false)?)
    }

    /// Render, dry-run check, atomically install, refresh. Each step is
    /// fatal on failure; a failed check leaves the temp file behind for
    /// inspection and the live config untouched.
    pub async fn install(&self, servers: &ServerSet) -> Result<(), InstallError> {
        let rendered = self.render(servers)?;
        let temp_path = self.temp_path();

        fs::write(&temp_path, &rendered)
            .await
            .map_err(|source| InstallError::Write { path: temp_path.clone(), source })?;
        debug!(path = %temp_path.display(), "Wrote candidate config");

        self.check(&temp_path).await?;

        fs::rename(&temp_path, &self.config_path).await.map_err(InstallError::Rename)?;
        self.refresh().await?;
        info!(path = %self.config_path.display(), servers = servers.len(), "Config installed");
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut path = self.config_path.clone().into_os_string();
        path.push(".tmp");
        PathBuf::from(path)
    }

    async fn check(&self, path: &Path) -> Result<(), InstallError> {
        let output = Command::new(&self.haproxy_exec)
            .arg("-f")
            .arg(path)
            .arg("-c")
            .output()
            .await
            .map_err(InstallError::Check)?;
        if !output.status.success() {
            return Err(InstallError::CheckFailed {
                path: path.to_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!(path = %path.display(), "Config check passed");
        Ok(())
    }

    async fn refresh(&self) -> Result<(), InstallError> {
        let output = Command::new("bash")
            .arg("-c")
            .arg(&self.refresh_command)
            .output()
            .await
            .map_err(InstallError::Refresh)?;
        if !output.status.success() {
            return Err(InstallError::RefreshFailed {
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!(command = %self.refresh_command, "Service refreshed");
        Ok(())
    }
}

fn server_entries(servers: &ServerSet, port: u16) -> Vec<ServerEntry> {
    servers
        .values()
        .map(|backend| ServerEntry {
            name: format!("{}:{}", backend.id, port),
            address: format_addr(&backend.address, port),
        })
        .collect()
}

/// IPv6 literals need brackets in front of the port.
fn format_addr(address: &str, port: u16) -> String {
    if address.contains(':') { format!("[{address}]:{port}") } else { format!("{address}:{port}") }
}

/// Find the haproxy binary named by the service manifest's `start/exec`
/// property. Done once at startup.
pub async fn discover_haproxy_exec(fmri: &str) -> anyhow::Result<PathBuf> {
    let output = Command::new("svcprop")
        .args(["-p", "start/exec", fmri])
        .output()
        .await
        .context("running svcprop")?;
    if !output.status.success() {
        bail!("svcprop -p start/exec {} failed: {}", fmri, String::from_utf8_lossy(&output.stderr).trim());
    }
    let exec = String::from_utf8_lossy(&output.stdout);
    parse_haproxy_exec(&exec)
        .ok_or_else(|| anyhow!("no haproxy path in start/exec value {:?}", exec.trim()))
}

/// First whitespace-separated token whose final path component is
/// `haproxy`.
pub fn parse_haproxy_exec(exec: &str) -> Option<PathBuf> {
    exec.split_whitespace()
        .map(|token| token.trim_matches(|c| c == '"' || c == '\''))
        .find(|token| Path::new(token).file_name().is_some_and(|name| name == "haproxy"))
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::watch::Backend;
    use std::net::{IpAddr, Ipv4Addr};

    fn server(id: &str, address: &str) -> (String, Backend) {
        (
            id.to_string(),
            Backend { id: id.to_string(), kind: "webapi".into(), address: address.into(), enabled: true },
        )
    }

    fn generator(dir: &Path, haproxy_exec: &str, refresh_command: &str) -> ConfigGenerator {
        ConfigGenerator::new(GeneratorArgs {
            hostname: "lb01".into(),
            nbthread: 4,
            trusted_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            untrusted_ips: vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))],
            config_path: dir.join("haproxy.cfg"),
            socket_path: "/tmp/haproxy".into(),
            haproxy_exec: haproxy_exec.into(),
            refresh_command: refresh_command.into(),
        })
    }

    const EXPECTED_CONFIG: &str = r#"global
        node lb01
        daemon
        user nobody
        group nobody
        maxconn 65535
        pidfile /var/run/haproxy.pid
        stats socket /tmp/haproxy mode 0600 level admin
        nbthread 4
        log 127.0.0.1 len 4096 local0

defaults
        log     global
        mode    http
        option  httplog
        option  redispatch
        no option httpclose
        no option http-server-close
        retries 3
        maxconn 65535
        timeout connect 2000
        timeout client  120000
        timeout server  240000

backend secure_api
        option httpchk GET /ping
        server 6f2c0a:80 10.77.77.12:80 check inter 30s slowstart 10s
        server 9b1d44:80 10.77.77.13:80 check inter 30s slowstart 10s

backend insecure_api
        option httpchk GET /ping
        server 6f2c0a:81 10.77.77.12:81 check inter 30s slowstart 10s
        server 9b1d44:81 10.77.77.13:81 check inter 30s slowstart 10s

frontend https
        bind 10.0.0.1:443
        default_backend secure_api

frontend http_external
        default_backend insecure_api
        bind 192.168.1.1:80

listen stats
        bind 10.0.0.1:8080
        mode http
        stats enable
        stats uri /stats
"#;

    #[test]
    fn render_matches_fixture() {
        let dir = tempfile::tempdir().expect("tempdir");
        let generator = generator(dir.path(), "true", "true");
        let servers: ServerSet =
            [server("9b1d44", "10.77.77.13"), server("6f2c0a", "10.77.77.12")].into_iter().collect();
        let rendered = generator.render(&servers).expect("render");
        assert_eq!(rendered, EXPECTED_CONFIG);
    }

    #[test]
    fn render_omits_external_frontend_without_untrusted_ips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut generator = generator(dir.path(), "true", "true");
        generator.untrusted_ips.clear();
        let servers: ServerSet = [server("6f2c0a", "10.77.77.12")].into_iter().collect();
        let rendered = generator.render(&servers).expect("render");
        assert!(!rendered.contains("http_external"));
        assert!(rendered.contains("frontend https"));
    }

    #[test]
    fn render_refuses_empty_pools() {
        let dir = tempfile::tempdir().expect("tempdir");
        let generator = generator(dir.path(), "true", "true");
        let err = generator.render(&ServerSet::new()).unwrap_err();
        assert!(matches!(err, RenderError::NoHosts));
    }

    #[test]
    fn ipv6_addresses_are_bracketed() {
        assert_eq!(format_addr("fd00::12", 80), "[fd00::12]:80");
        assert_eq!(format_addr("10.0.0.1", 81), "10.0.0.1:81");
    }

    #[test]
    fn manifest_exec_parsing() {
        assert_eq!(
            parse_haproxy_exec("/opt/local/sbin/haproxy -f %{config_file} -D"),
            Some(PathBuf::from("/opt/local/sbin/haproxy"))
        );
        assert_eq!(
            parse_haproxy_exec("ctrun -l child -o noorphan /opt/local/sbin/haproxy -D"),
            Some(PathBuf::from("/opt/local/sbin/haproxy"))
        );
        assert_eq!(parse_haproxy_exec("/usr/bin/nginx -c /etc/nginx.conf"), None);
        assert_eq!(parse_haproxy_exec(""), None);
    }

    #[tokio::test]
    async fn install_is_atomic_on_check_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_path = dir.path().join("haproxy.cfg");
        std::fs::write(&config_path, "previous config\n").expect("seed config");

        let generator = generator(dir.path(), "false", "true");
        let servers: ServerSet = [server("6f2c0a", "10.77.77.12")].into_iter().collect();
        let err = generator.install(&servers).await.unwrap_err();
        assert!(matches!(err, InstallError::CheckFailed { .. }));

        // The live config is untouched and the candidate is kept around.
        assert_eq!(std::fs::read_to_string(&config_path).expect("read"), "previous config\n");
        assert!(dir.path().join("haproxy.cfg.tmp").exists());
    }

    #[tokio::test]
    async fn install_renames_checked_config_into_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let generator = generator(dir.path(), "true", "true");
        let servers: ServerSet = [server("6f2c0a", "10.77.77.12")].into_iter().collect();
        generator.install(&servers).await.expect("install");

        let installed = std::fs::read_to_string(dir.path().join("haproxy.cfg")).expect("read");
        assert_eq!(installed, generator.render(&servers).expect("render"));
        assert!(!dir.path().join("haproxy.cfg.tmp").exists());
    }

    #[tokio::test]
    async fn failed_refresh_surfaces() {
        let dir = tempfile::tempdir().expect("tempdir");
        let generator = generator(dir.path(), "true", "echo refresh-broken >&2; false");
        let servers: ServerSet = [server("6f2c0a", "10.77.77.12")].into_iter().collect();
        let err = generator.install(&servers).await.unwrap_err();
        match err {
            InstallError::RefreshFailed { stderr } => assert_eq!(stderr, "refresh-broken"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
