use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use fabric_agent::agent::Agent;
use fabric_agent::config::{AgentConfig, Cli};
use fabric_agent::routing::RouteTableStore;
use fabric_agent::telemetry::Telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AgentConfig::try_from(cli)?;
    let telemetry = Telemetry::init(&config.log_filter)?;
    info!(
        listen_addr = %config.listen_addr,
        routes_file = ?config.routes_file,
        "starting fabric agent"
    );

    let routes = match &config.routes_file {
        Some(path) => RouteTableStore::from_file(path)
            .with_context(|| format!("failed to load routing table from {}", path.display()))?,
        None => RouteTableStore::default(),
    };
    let agent = Agent::start(&config, routes)
        .context("failed to start message bus")?
        .with_metrics(telemetry.metrics_handle());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        info!("shutdown signal received");
        signal_token.cancel();
    });

    agent.serve(listener, shutdown).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}
