//! spawn-relay-server: session spawn relay.
//!
//! Accepts WebSocket connections from web clients and machine daemons, and
//! forwards each client's `session:spawn` request to a daemon as an RPC.

mod config;
mod handshake;
mod relay;
mod server;
mod transport;

use clap::Parser;
use config::{ConfigOverrides, ServerConfig};
use server::RelayServer;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{error, info};

/// spawn-relay-server: session spawn relay
#[derive(Parser, Debug)]
#[command(name = "spawn-relay-server", version, about = "Session spawn relay")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Config file path
    #[arg(long, default_value = "~/.spawn-relay/config.toml")]
    config: String,

    /// Seconds to wait for a daemon to answer an RPC
    #[arg(long)]
    rpc_timeout: Option<u64>,

    /// Hex-encoded HMAC secret for identity tokens
    #[arg(long, env = "SPAWN_RELAY_TOKEN_SECRET", hide_env_values = true)]
    token_secret: Option<String>,

    /// Reject connections without a valid identity token
    #[arg(long)]
    require_token: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting spawn-relay-server");

    let overrides = ConfigOverrides {
        bind: cli.bind,
        port: cli.port,
        rpc_timeout_secs: cli.rpc_timeout,
        token_secret: cli.token_secret,
        require_token: cli.require_token,
    };
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let bound = match RelayServer::new(server_config).bind().await {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to start listener");
            std::process::exit(1);
        }
    };

    bound.serve(shutdown_signal()).await;

    info!("spawn-relay-server stopped");
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
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
