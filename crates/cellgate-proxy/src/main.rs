//! cellgate-proxy: protocol-aware WebSocket proxy for a Jupyter kernel
//! gateway.
//!
//! Rewrites execute-request cell indices into cell source in flight and
//! manages deferred kernel deletion across client disconnects.

use cellgate_proxy::{ProxyConfig, ProxyGateway};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

/// cellgate-proxy — kernel gateway proxy
#[derive(Parser, Debug)]
#[command(name = "cellgate-proxy", version, about = "Kernel gateway proxy")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.cellgate/config.toml")]
    config: String,

    /// Kernel gateway base URL
    #[arg(long)]
    gateway_url: Option<String>,

    /// Kernel gateway auth token
    #[arg(long)]
    auth_token: Option<String>,

    /// Kernel retention window after disconnect, in seconds
    #[arg(long)]
    retention_secs: Option<u64>,

    /// Path prefix stripped before forwarding
    #[arg(long)]
    prefix: Option<String>,

    /// Notebook root directory
    #[arg(long)]
    notebook_dir: Option<String>,

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

    info!(version = env!("CARGO_PKG_VERSION"), "starting cellgate-proxy");

    let config_path = PathBuf::from(&cli.config);
    let config = match ProxyConfig::load(
        Some(&config_path),
        cli.port,
        cli.prefix.as_deref(),
        cli.gateway_url.as_deref(),
        cli.auth_token.as_deref(),
        cli.retention_secs,
        cli.notebook_dir.as_deref(),
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let gateway = ProxyGateway::from_config(config);

    tokio::select! {
        result = gateway.run() => {
            if let Err(e) = result {
                error!(error = %e, "proxy error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("cellgate-proxy stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
