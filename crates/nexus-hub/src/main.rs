//! Hub binary: load configuration, run until interrupted.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nexus_hub::{Hub, HubConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args().nth(1);
    let config = match HubConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(config_error) => {
            error!("Failed to load configuration: {config_error}");
            std::process::exit(1);
        }
    };

    let hub: Arc<Hub> = match Hub::new(config) {
        Ok(hub) => hub,
        Err(init_error) => {
            error!("Failed to initialize hub: {init_error}");
            std::process::exit(1);
        }
    };

    hub.start().await;

    if let Err(signal_error) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {signal_error}");
    }
    info!("Shutdown signal received");

    hub.shutdown().await;
}
