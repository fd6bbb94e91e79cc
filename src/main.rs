use anyhow::{Context, Result};
use clap::Parser;
use muppet::{
    clients::haproxy::HaproxySocket,
    config::Config,
    hostname,
    routes::{self, AppState},
    services::{
        generator::{ConfigGenerator, GeneratorArgs, discover_haproxy_exec},
        manager::LbManager,
    },
    supervisor::Supervisor,
    workers::socket::{AdminSocket, CommandWorker},
};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Keeps the local HAProxy in sync with the hosts registered for a
/// service domain.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Raise log verbosity (repeatable)
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to the JSON configuration file
    #[clap(short, long = "file", default_value = "/opt/smartdc/muppet/etc/config.json")]
    file: PathBuf,

    /// Override the configured metrics port
    #[clap(short, long = "metricsPort")]
    metrics_port: Option<u16>,
}

fn init_logging(config_level: &str, verbose: u8) {
    let level = match verbose {
        0 => config_level,
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(&cli.file)?;
    if let Some(port) = cli.metrics_port {
        config.metrics_port = port;
    }
    init_logging(&config.log_level, cli.verbose);

    let inst_id = hostname::instance_id();
    info!(domain = %config.domain, host = %inst_id, "Starting up");

    let socket_path = config.haproxy.admin_socket_path();
    let socket: Arc<dyn AdminSocket> =
        Arc::new(CommandWorker::spawn(HaproxySocket::new(&socket_path)));
    info!(socket = %socket_path.display(), "Admin socket serializer running");

    let haproxy_exec = match &config.haproxy.exec_path {
        Some(path) => path.clone(),
        None => discover_haproxy_exec(&config.haproxy.service_fmri)
            .await
            .context("discovering the haproxy binary")?,
    };
    info!(path = %haproxy_exec.display(), "Using haproxy binary");

    let generator = ConfigGenerator::new(GeneratorArgs {
        hostname: inst_id.clone(),
        nbthread: config.haproxy.nbthread,
        trusted_ip: config.trusted_ip,
        untrusted_ips: config.untrusted_ips.clone(),
        config_path: config.haproxy.config_path.clone(),
        socket_path,
        haproxy_exec,
        refresh_command: config.haproxy.refresh_command.clone(),
    });
    let manager = Arc::new(LbManager::new(Box::new(generator)));

    let metrics_ip =
        config.admin_ips.first().copied().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let metrics_addr = SocketAddr::new(metrics_ip, config.metrics_port);
    let router = routes::build_router(AppState { socket: Arc::clone(&socket), inst_id });
    tokio::spawn(async move {
        if let Err(e) = axum_server::bind(metrics_addr).serve(router.into_make_service()).await {
            error!(error = %e, "Metrics endpoint failed");
        }
    });
    info!(addr = %metrics_addr, "Metrics endpoint listening");

    let supervisor = Supervisor::new(config, socket, manager)?;
    supervisor.run().await
}
