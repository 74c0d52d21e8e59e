use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use piko_server::{Node, ServerConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Piko server node: reverse-tunnel gateway data plane.
#[derive(Debug, Parser)]
#[command(name = "piko-server")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let args = Args::parse();
    let config = match args.config {
        Some(path) => match ServerConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "bad configuration");
                return ExitCode::from(2);
            }
        },
        None => ServerConfig::default(),
    };

    let node = match Node::start(config).await {
        Ok(node) => node,
        Err(e) => {
            error!(error = %e, "failed to start");
            return ExitCode::from(1);
        }
    };

    shutdown_signal().await;
    node.shutdown().await;
    ExitCode::SUCCESS
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful
/// shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
