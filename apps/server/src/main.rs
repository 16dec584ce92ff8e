//! Songnest Server - Standalone headless server for the Songnest jukebox.
//!
//! Runs the full core: nest registry, per-nest playhead workers, the idle
//! reaper, and the HTTP/WebSocket/SSE surface, against a shared store.
//! Any number of server processes can point at the same store; playhead
//! leases keep exactly one of them advancing each nest.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use songnest_core::{bootstrap_services, start_server, AppState};
use tokio::signal;

use crate::config::ServerConfig;

/// Songnest Server - Headless multi-tenant collaborative jukebox server.
#[derive(Parser, Debug)]
#[command(name = "songnest-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "SONGNEST_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "SONGNEST_BIND_PORT")]
    port: Option<u16>,

    /// Play-log directory (overrides config file).
    #[arg(short = 'd', long, env = "SONGNEST_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Songnest Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = args.port {
        config.bind_port = port;
    }
    if let Some(log_dir) = args.log_dir {
        config.log_dir = log_dir;
    }

    log::info!(
        "Configuration: bind_port={}, store={}, log_dir={}",
        config.bind_port,
        config.store_url,
        config.log_dir.display()
    );

    // Bootstrap services (store connection, history import, main nest)
    let services = bootstrap_services(config.to_core_config())
        .await
        .context("Failed to bootstrap services")?;

    log::info!("Services bootstrapped successfully");

    // Start playhead workers and the idle-nest reaper
    services.start_background_tasks();

    // Build app state for the HTTP server
    let app_state = AppState::new(
        services.services.clone(),
        services.ws_manager.clone(),
    );

    let bind_port = config.bind_port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(app_state, bind_port).await {
            log::error!("Server error: {}", e);
        }
    });

    log::info!("HTTP server started on port {}", bind_port);

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");

    // Graceful shutdown
    services.shutdown().await;
    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
