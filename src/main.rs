use anyhow::{Context, Result};
use axum::Router;
use clap::Parser;
use postnow_admission::config::Cli;
use postnow_admission::server::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("postnow_admission={},tower_http=debug", cli.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = cli
        .admission_config()
        .context("Failed to load admission configuration")?;

    tracing::info!("Starting PostNow admission layer");

    // Application routes are mounted by the embedding service.
    let server = Server::new(&cli, config, Router::new()).context("Failed to create server")?;

    server
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
