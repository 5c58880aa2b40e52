//! parley-server: relays envelopes between WebSocket clients by id.
//!
//! Clients connect to `/ws?uid=<id>`; every envelope a client sends is
//! forwarded to the live connection registered under its `receiver_id`.

mod config;
mod connection;
mod limits;
mod relay;
mod server;
mod transport;

use clap::Parser;
use config::{Overrides, ServerConfig};
use server::RelayServer;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// parley-server: WebSocket relay
#[derive(Parser, Debug)]
#[command(name = "parley-server", version, about = "Relays messages between WebSocket clients by id")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "conf/configs.toml")]
    config: String,

    /// Listen host (overrides ws.host)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides ws.port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Maximum concurrent connections (overrides ws.conn)
    #[arg(long)]
    max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting parley-server");

    let config_path = PathBuf::from(&cli.config);
    let overrides = Overrides {
        host: cli.host,
        port: cli.port,
        max_connections: cli.max_connections,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };
    info!(config = %server_config, "configuration resolved");
    info!(
        host = %server_config.grpc_host,
        port = server_config.grpc_port,
        "gRPC listener configured but not served"
    );

    let server = RelayServer::new(server_config);
    let listener = match server.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "failed to bind listener");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.serve(listener, shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}

/// Wait for Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler, waiting for Ctrl-C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("received shutdown signal");
}
