use anyhow::{Context, Result};
use clap::Parser;
use handoff::Graceful;
use tracing::info;

mod config;
mod http;
mod telemetry;

use config::{Cli, ServerConfig};
use http::HttpHandler;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init().context("Failed to initialize telemetry")?;

    let config = ServerConfig::from(cli);
    info!("Handoff Server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    config.log_config();

    Graceful::new(config.addr.clone(), HttpHandler::new(config.mode))
        .mode(config.mode)
        .shutdown_timeout(config.shutdown_timeout)
        .stop_signals(config.stop_signals.iter().copied())
        .restart_signals(config.restart_signals.iter().copied())
        .run()
        .await
        .with_context(|| format!("Server on {} failed", config.addr))?;

    telemetry::shutdown();
    Ok(())
}
