//! hostnet node (v0.1)
//!
//! Brings up the host network layer of a peer-to-peer node and keeps it
//! running until SIGINT/SIGTERM.
//!
//! # Architecture Overview
//!
//! ```text
//!   config file + CLI ──▶ NodeConfig ──▶ Network::start (engine thread)
//!                                          │
//!                    ┌─────────────────────┼───────────────────────┐
//!                    ▼                     ▼                       ▼
//!              bind listener        resolve endpoint          accept loop
//!            (ephemeral fallback)  (user > public > UPnP      (on_connection)
//!                                    > private)
//!                                          │
//!                                    maintenance tick (on_run)
//!
//!   SIGINT/SIGTERM ──▶ Network::stop ──▶ on_shutdown polls ──▶ acceptor closed
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clap::Parser;

use hostnet::config::loader::load_config;
use hostnet::config::validation::validate_config;
use hostnet::config::NodeConfig;
use hostnet::lifecycle::signals::shutdown_signal;
use hostnet::net::{Connection, Network, NetworkHooks, Upnp};
use hostnet::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "hostnet")]
#[command(about = "Host network layer of a peer-to-peer node", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Preferred listen port.
    #[arg(short = 'p', long)]
    listen_port: Option<u16>,

    /// Public IP to advertise instead of autodetecting.
    #[arg(long)]
    public_ip: Option<String>,

    /// Disable UPnP port mapping.
    #[arg(long)]
    no_upnp: bool,

    /// Allow private addresses to be advertised.
    #[arg(long)]
    local_networking: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(&self, config: &mut NodeConfig) {
        if let Some(port) = self.listen_port {
            config.network.listen_port = port;
        }
        if let Some(ip) = &self.public_ip {
            config.network.public_ip = ip.clone();
        }
        if self.no_upnp {
            config.network.upnp = false;
        }
        if self.local_networking {
            config.network.local_networking = true;
        }
        if let Some(level) = &self.log_level {
            config.observability.log_level = level.clone();
        }
    }
}

/// Logs each inbound connection and lets it go.
#[derive(Default)]
struct LoggingHooks {
    accepted: AtomicU64,
}

impl NetworkHooks for LoggingHooks {
    fn on_startup(&self) {
        tracing::info!("Network up");
    }

    fn on_connection(&self, connection: Arc<Connection>) {
        let total = self.accepted.fetch_add(1, Ordering::Relaxed) + 1;
        match connection.remote_endpoint() {
            Ok(remote) => tracing::info!(connection_id = %connection.id(), remote = %remote, total, "Peer connected"),
            Err(e) => tracing::warn!(connection_id = %connection.id(), error = %e, "Peer connected without remote"),
        }
    }

    fn on_shutdown(&self) -> bool {
        tracing::info!(
            accepted = self.accepted.load(Ordering::Relaxed),
            "Network shutting down"
        );
        true
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => NodeConfig::default(),
    };
    cli.apply(&mut config);

    logging::init_logging(&config.observability.log_level);
    tracing::info!("hostnet v0.1.0 starting");

    if let Err(errors) = validate_config(&config) {
        for error in &errors {
            tracing::error!(%error, "Invalid configuration");
        }
        return Err(format!("{} configuration error(s)", errors.len()).into());
    }

    tracing::info!(
        listen_port = config.network.listen_port,
        public_ip = %config.network.public_ip,
        upnp = config.network.upnp,
        local_networking = config.network.local_networking,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let network = Arc::new(Network::with_config(
        config.network.clone(),
        config.engine.clone(),
        LoggingHooks::default(),
        Upnp::new(config.upnp.clone()),
    ));

    let starting = network.clone();
    tokio::task::spawn_blocking(move || starting.start(true)).await??;

    tracing::info!(
        listen_port = ?network.listen_port(),
        public_endpoint = ?network.public_endpoint(),
        "Accepting peers"
    );

    shutdown_signal().await;

    let stopping = network.clone();
    tokio::task::spawn_blocking(move || stopping.stop(true)).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
