use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::prelude::*;

use relief_gateway::config::CliOverrides;
use relief_gateway::{AppState, GatewayConfig, build_router, default_routes, termination_signal};

#[derive(Parser)]
#[command(name = "relief-gateway")]
#[command(about = "Real-time coordination gateway for the disaster relief platform")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, default_value = "gateway.toml")]
    config: PathBuf,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port for the gateway
    #[arg(short, long)]
    port: Option<u16>,

    /// Force development mode (failure details in error bodies)
    #[arg(long)]
    dev: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "relief_gateway=debug,tower_http=debug,info"
    } else {
        "relief_gateway=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let overrides = CliOverrides {
        host: cli.host,
        port: cli.port,
        development: cli.dev,
    };
    let config = GatewayConfig::load(&cli.config, &overrides)?;
    info!(
        mode = ?config.mode,
        allowed_origins = ?config.allowed_origins,
        "Configuration loaded"
    );

    let state = AppState::new(config);
    let routes = default_routes(&state).context("Failed to register route bindings")?;
    let state = state.with_routes(routes);

    let listen_addr = state.config.listen_addr;
    let listener = state
        .lifecycle
        .bind(listen_addr)
        .await
        .context("Failed to start gateway")?;

    info!("API endpoints:");
    for (name, prefix) in state.routes.endpoints() {
        info!("  {:<14} {}/*", name, prefix);
    }
    info!("  {:<14} /ws", "websocket");

    let app = build_router(state.clone());
    let report = state
        .lifecycle
        .run(listener, app, termination_signal())
        .await?;

    if report.timed_out {
        info!(
            remaining = report.sessions_remaining,
            "Stopped with sessions force-closed"
        );
    }
    Ok(())
}
