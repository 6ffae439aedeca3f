mod bridge;
mod bus;
mod command;
mod config;
mod discovery;
mod ecp;
mod keys;
mod poller;
mod registry;
mod scheduler;
mod slug;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use crate::bridge::{Bridge, BridgeEvent, SCAN_DELAY};
use crate::bus::BusError;
use crate::config::Config;
use crate::ecp::EcpClient;
use crate::keys::KeyAliasTable;
use crate::scheduler::{Scheduler, TokioScheduler};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_directive()))
        )
        .init();

    tracing::info!("Starting roku-mqttd");
    tracing::info!("Loaded config from {}", config_path);

    let keys = KeyAliasTable::build();
    tracing::debug!("Built {} key aliases", keys.len());

    let client = EcpClient::new()?;

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    // Spawn device worker task
    let worker_cancel = cancel.clone();
    let worker_events = events_tx.clone();
    let worker_handle = tokio::spawn(async move {
        if let Err(e) = ecp::worker::run(client, requests_rx, worker_events, worker_cancel).await {
            tracing::error!("Device worker error: {}", e);
        }
    });

    // Spawn bridge task
    let mut scheduler = TokioScheduler::new(events_tx.clone());
    let bridge = Bridge::new(&config, keys, scheduler.clone(), requests_tx, outbound_tx)?;
    let bridge_cancel = cancel.clone();
    let bridge_handle = tokio::spawn(async move {
        if let Err(e) = bridge.run(events_rx, bridge_cancel).await {
            tracing::error!("Bridge error: {}", e);
        }
    });

    // Spawn MQTT task
    let mut bus_handle = tokio::spawn(bus::mqtt::run(
        config.clone(),
        events_tx,
        outbound_rx,
        cancel.clone(),
    ));

    scheduler.after(SCAN_DELAY, BridgeEvent::ScanAll);

    // Wait for shutdown signal or a fatal bus error
    let exit_code = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl-c")?;
            tracing::info!("Shutdown signal received");
            cancel.cancel();
            match bus_handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("MQTT error: {:#}", e),
                Err(e) => tracing::error!("MQTT task failed: {}", e),
            }
            0
        }
        finished = &mut bus_handle => match finished {
            Ok(Ok(())) => 0,
            Ok(Err(e)) => {
                tracing::error!("MQTT error: {:#}", e);
                e.downcast_ref::<BusError>().map_or(1, BusError::exit_code)
            }
            Err(e) => {
                tracing::error!("MQTT task failed: {}", e);
                1
            }
        },
    };

    // Trigger cancellation
    cancel.cancel();

    // Wait for remaining tasks to complete
    let _ = tokio::join!(worker_handle, bridge_handle);

    tracing::info!("Shutdown complete");
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
