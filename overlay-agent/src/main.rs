//! Overlay Agent - Main entry point
//!
//! Serves the backup/restore command surface over HTTP.

use anyhow::Result;
use clap::Parser;
use overlay_agent::{api, config::Config, daemon::shutdown::ShutdownCoordinator, utils, Engine};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load(args.config.as_deref())?;
    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    // Initialize start time for uptime tracking
    api::health::init_start_time();

    tracing::info!(
        "Starting overlay-agent v{} (device: {}, overlay: {})",
        env!("CARGO_PKG_VERSION"),
        config.agent.id,
        config.overlay.root.display()
    );

    let engine = Arc::new(Engine::from_config(&config));

    // Finish anything a previous run left half done before taking requests
    let recovery_engine = engine.clone();
    tokio::task::spawn_blocking(move || recovery_engine.recover())
        .await
        .map_err(|e| anyhow::anyhow!(e))??;

    let port = args.port.unwrap_or(config.agent.port);
    let ip = config
        .agent
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address {}: {}", config.agent.bind, e))?;
    let addr = SocketAddr::new(ip, port);

    let app = api::create_router(api::AppState::new(engine), config.archive.max_upload_bytes);

    let shutdown = ShutdownCoordinator::new();
    let signal_watcher = shutdown.clone();
    tokio::spawn(async move {
        signal_watcher.wait_for_signal().await;
    });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}", addr);
    tracing::info!("Health endpoint: http://{}/health", addr);
    tracing::info!("WebSocket endpoint: ws://{}/ws", addr);

    let token = shutdown.token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}
