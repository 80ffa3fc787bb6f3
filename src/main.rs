//! dispatcher - Kubernetes ingress controller sidecar for nginx

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dispatcher::cache::Cache;
use dispatcher::config::Config;
use dispatcher::nginx::{self, NginxDriver};
use dispatcher::reconcile::Reconciler;

/// Watches routable namespaces, pods, and API-key secrets and keeps the
/// co-located nginx configuration in sync
#[derive(Parser, Debug)]
#[command(name = "dispatcher", version, about, long_about = None)]
struct Cli {
    /// Log generated configuration instead of writing it and driving nginx
    #[arg(long)]
    mock: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config =
        Config::from_env().map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    config.nginx.run_in_mock_mode = cli.mock;
    let config = Arc::new(config);

    tracing::info!(
        selector = %config.routable_label_selector,
        mock = config.nginx.run_in_mock_mode,
        "starting the kubernetes router"
    );

    let client = kube::Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kubernetes client: {e}"))?;

    // Bring nginx up with an empty configuration before the first list so
    // the default server answers immediately
    let driver = NginxDriver::new(&config);
    let initial = nginx::render_config(&config, &Cache::new())
        .map_err(|e| anyhow::anyhow!("failed to render initial configuration: {e}"))?;
    driver
        .start(&initial)
        .await
        .map_err(|e| anyhow::anyhow!("failed to start nginx: {e}"))?;

    let reconciler = Reconciler::new(config, client, driver);
    reconciler
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("reconcile loop failed: {e}"))?;

    Ok(())
}
