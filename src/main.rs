//! rtun server
//!
//! Serves the agent control plane and opens tunnelled ports on demand.

use anyhow::{Context, Result};
use clap::Parser;
use rtun::{router, AppState};
use rtun_proto::ServerConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Reverse tunnel server - exposes ports for agents connected over WebSockets
#[derive(Parser, Debug)]
#[command(name = "rtun-server")]
#[command(about = "Expose TCP/UDP ports on behalf of remote agents", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Server configuration file (YAML)
    #[arg(short, long, env = "RTUN_CONFIG")]
    config: PathBuf,

    /// Control-plane listen address, overrides `listen` from the config
    #[arg(long, env = "RTUN_LISTEN")]
    listen: Option<SocketAddr>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let mut config = ServerConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    info!("Starting rtun server {}", env!("GIT_TAG"));
    info!("Control plane: {}", config.listen);
    info!("Tunnelled ports bind on {}", config.bind_host);
    info!("{} agent keys configured", config.agents.len());

    let app = router(AppState::new(&config));
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind control plane on {}", config.listen))?;

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    if let Err(e) = server.await {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping server..."),
        Err(err) => error!("Error listening for shutdown signal: {}", err),
    }
}
