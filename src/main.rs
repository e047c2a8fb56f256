//! RedVault Server Binary
//!
//! Main entry point for the RedVault TCP server

use clap::Parser;
use redvault::{Result, RedVaultServer, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::{fmt, EnvFilter};

/// RedVault Server
#[derive(Parser, Debug)]
#[command(name = "redvault-server")]
#[command(about = "RESP key-value server with append-only persistence")]
#[command(version)]
struct Args {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address (host:port), overrides the config file
    #[arg(short, long)]
    bind: Option<String>,

    /// Append-only log path, overrides the config file
    #[arg(short, long)]
    aof: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,redvault=debug"));
    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(aof) = args.aof {
        config.aof_path = aof;
    }

    let server = match RedVaultServer::new(config).await {
        Ok(server) => Arc::new(server),
        Err(e) => {
            tracing::error!("Failed to restore state: {}", e);
            return Err(e);
        }
    };

    // Setup graceful shutdown on SIGINT / SIGTERM
    let server_clone = Arc::clone(&server);
    tokio::spawn(async move {
        termination_signal().await;
        tracing::info!("Received termination signal, initiating graceful shutdown...");
        server_clone.shutdown();
    });

    server.run().await
}

#[cfg(unix)]
async fn termination_signal() {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};

    match unix_signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("Failed to listen for SIGTERM: {}", e);
            let _ = signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn termination_signal() {
    if let Err(e) = signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl+C: {}", e);
    }
}
