use std::env;
use std::path::Path;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use vent::chain::RpcChain;
use vent::config::VentConfig;
use vent::projection::Consumer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = env::args().nth(1).unwrap_or_else(|| "config/vent.json".to_string());
    let config = VentConfig::load(Path::new(&config_path))?;
    tracing::info!(config = %config_path, "configuration loaded");

    let chain =
        RpcChain::from_url(&config.chain_url, Duration::from_millis(config.poll_interval_ms))?;
    let (consumer, shutdown) = Consumer::new(config, Box::new(chain))?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            shutdown.signal();
        }
    });

    if let Err(e) = consumer.run().await {
        tracing::error!(error = %e, "projection failed");
        std::process::exit(1);
    }
    Ok(())
}
