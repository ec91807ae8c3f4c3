//! cluster-daemon: pairs machines and joins them into every local subsystem.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cluster_daemon::{Config, Daemon};

#[derive(Parser, Debug)]
#[command(name = "cluster-daemon")]
#[command(about = "Cluster pairing and membership daemon")]
struct Args {
    /// Directory holding the configuration and identity certificate
    #[arg(long, default_value = "/var/lib/cluster-daemon", env = "CLUSTER_CONFIG")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,cluster_daemon=debug,cluster_core=debug"
    } else {
        "info,cluster_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting cluster-daemon");
    info!("Config directory: {:?}", args.config);

    let config = Config::load(&args.config)?;

    let public = TcpListener::bind(&config.listen.public)
        .await
        .with_context(|| format!("Failed to bind public listener on {}", config.listen.public))?;
    let control = TcpListener::bind(&config.listen.control)
        .await
        .with_context(|| format!("Failed to bind control listener on {}", config.listen.control))?;

    let daemon = Daemon::build(&config, &args.config, public.local_addr()?)?;
    daemon.serve(public, control, shutdown_signal()).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
