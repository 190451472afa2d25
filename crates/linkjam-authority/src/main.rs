//! Tempo authority binary.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `linkjam-config.yaml` (or `LINKJAM_CONFIG`)
//! 2. Initialize structured logging (tracing)
//! 3. Build the shared room registry and fan-out hub
//! 4. Serve HTTP and `WebSocket` traffic until `Ctrl-C`

use std::sync::Arc;

use anyhow::Context;
use linkjam_authority::{AppState, start_server};
use linkjam_core::config::{LinkJamConfig, LoggingConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = LinkJamConfig::load().context("loading configuration")?;
    init_tracing(&config.logging);

    info!(
        host = %config.authority.host,
        port = config.authority.port,
        default_bpm = config.rooms.bpm,
        default_bpi = config.rooms.bpi,
        "linkjam-authority starting"
    );

    let state = Arc::new(AppState::new(config.rooms.clone()));
    start_server(&config.authority, state)
        .await
        .context("running authority server")?;

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
