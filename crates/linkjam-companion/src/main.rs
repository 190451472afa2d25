//! Companion binary.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `linkjam-config.yaml` (or `LINKJAM_CONFIG`)
//! 2. Initialize structured logging (tracing)
//! 3. Connect to the local tempo engine
//! 4. Connect to the authority, retrying with a fixed backoff
//! 5. Follow the room until `Ctrl-C`, reconnecting after drops

use std::sync::Arc;

use anyhow::Context;
use linkjam_companion::engine::{LineEngineBridge, TempoEngine};
use linkjam_companion::{Coordinator, SchedulerEvent};
use linkjam_core::config::{LinkJamConfig, LoggingConfig};
use linkjam_core::time::{SystemClock, TimeSource};
use linkjam_types::SchedulerStatus;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = LinkJamConfig::load().context("loading configuration")?;
    init_tracing(&config.logging);

    info!(
        authority_url = %config.companion.authority_url,
        room_id = %config.companion.room_id,
        dj_name = %config.companion.dj_name,
        engine_addr = %config.engine.addr,
        "linkjam-companion starting"
    );

    let (bridge, engine_events) = LineEngineBridge::new(config.engine.clone());
    bridge.start().await.context("connecting to tempo engine")?;
    let bridge = Arc::new(bridge);
    if let Err(e) = bridge.set_start_stop_sync(true).await {
        warn!("Could not enable start/stop sync: {e}");
    }

    let clock: Arc<dyn TimeSource> = Arc::new(SystemClock);
    let coordinator = Arc::new(Coordinator::new(&config, Arc::clone(&bridge), clock));
    let engine_pump = coordinator.spawn_engine_pump(engine_events);
    let logger = tokio::spawn(log_events(coordinator.scheduler().subscribe_events()));

    tokio::select! {
        result = follow_room(&coordinator, &config) => {
            if let Err(e) = result {
                error!("Giving up on authority: {e:#}");
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
    }

    coordinator.disconnect().await;
    engine_pump.abort();
    logger.abort();
    bridge.stop().await;
    info!("linkjam-companion stopped");
    Ok(())
}

/// Connect, stay connected until the channel drops, repeat.
async fn follow_room(
    coordinator: &Coordinator<LineEngineBridge>,
    config: &LinkJamConfig,
) -> anyhow::Result<()> {
    loop {
        connect_with_retry(coordinator, config).await?;

        let mut status = coordinator.scheduler().subscribe_status();
        status
            .wait_for(|s| *s == SchedulerStatus::Disconnected)
            .await
            .context("scheduler status channel closed")?;
        warn!("Lost the authority, reconnecting");
        tokio::time::sleep(config.companion.reconnect_backoff()).await;
    }
}

/// Up to `reconnect_attempts` tries spaced by `reconnect_backoff`.
async fn connect_with_retry(
    coordinator: &Coordinator<LineEngineBridge>,
    config: &LinkJamConfig,
) -> anyhow::Result<()> {
    let attempts = config.companion.reconnect_attempts.max(1);
    for attempt in 1..=attempts {
        match coordinator.connect().await {
            Ok(_) => return Ok(()),
            Err(e) if attempt < attempts => {
                warn!(attempt, attempts, "Connect failed: {e}");
                tokio::time::sleep(config.companion.reconnect_backoff()).await;
            }
            Err(e) => {
                return Err(e).context(format!("connecting after {attempts} attempts"));
            }
        }
    }
    anyhow::bail!("no connect attempts configured")
}

async fn log_events(mut events: broadcast::Receiver<SchedulerEvent>) {
    loop {
        match events.recv().await {
            Ok(SchedulerEvent::Locked {
                bpm,
                bpi,
                boundary_local_ms,
            }) => info!(bpm, bpi, boundary_local_ms, "Engine locked to room"),
            Ok(SchedulerEvent::BoundaryUpdated(boundary)) => debug!(
                bar = boundary.position.bar,
                beat = boundary.position.beat,
                ms_until_boundary = boundary.ms_until_boundary,
                "Boundary"
            ),
            Ok(SchedulerEvent::PeersChanged(peers)) => info!(peers, "Link peers"),
            Ok(SchedulerEvent::ApplyFailed { message }) => {
                warn!(message = %message, "Apply failed");
            }
            Ok(SchedulerEvent::StatusChanged(_)) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Event logger lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
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
