//! Hi-Fi Server - standalone headless host for Unified Hi-Fi Control.
//!
//! Wires every configured backend onto the zone bus, starts them, and logs
//! zone and connectivity changes until a shutdown signal arrives.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use hifi_core::{bootstrap_services, Bus, BusEvent, LoggingEventEmitter, ZoneQuery};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

use crate::config::ServerConfig;

/// Hi-Fi Server - one zone model over Roon, UPnP, OpenHome, LMS and HQPlayer.
#[derive(Parser, Debug)]
#[command(name = "hifi-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE", env = "HIFI_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "HIFI_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Seconds between status summaries (overrides config file, 0 disables).
    #[arg(short = 's', long)]
    status_interval: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Hi-Fi Server v{}", env!("CARGO_PKG_VERSION"));

    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(interval) = args.status_interval {
        config.status_interval_secs = interval;
    }

    let services = bootstrap_services(&config.core).context("Failed to bootstrap services")?;
    services
        .events
        .set_external_emitter(Arc::new(LoggingEventEmitter));

    services.bus.start_all().await;
    log::info!("Backends started");

    let bus = Arc::clone(&services.bus);
    let cancel = services.cancel_token.clone();
    let status_interval = Duration::from_secs(config.status_interval_secs);
    let monitor = tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = watch_bus(&bus, status_interval) => {}
        }
    });

    shutdown_signal().await;
    log::info!("Shutdown signal received, cleaning up...");

    services.shutdown().await;
    if let Err(e) = monitor.await {
        log::warn!("Bus monitor ended abnormally: {}", e);
    }

    log::info!("Shutdown complete");
    Ok(())
}

/// Logs bus events and, when `status_interval` is non-zero, a periodic
/// per-backend summary.
async fn watch_bus(bus: &Bus, status_interval: Duration) {
    let mut events = bus.subscribe();
    let mut ticker = (!status_interval.is_zero()).then(|| {
        let mut interval = tokio::time::interval(status_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });

    loop {
        let tick = async {
            match ticker.as_mut() {
                Some(interval) => {
                    interval.tick().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            event = events.recv() => match event {
                Ok(BusEvent::ZonesChanged { backend, .. }) => {
                    let query = ZoneQuery { backend: Some(backend.clone()) };
                    let zones = bus.zones(&query).await;
                    log::info!("[{}] {} zone(s)", backend, zones.len());
                    for zone in zones {
                        log::debug!("  {} {:?} {}", zone.zone_id, zone.state, zone.display_name);
                    }
                }
                Ok(BusEvent::BackendStatusChanged { backend, connected, .. }) => {
                    log::info!(
                        "[{}] {}",
                        backend,
                        if connected { "connected" } else { "disconnected" }
                    );
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Bus monitor lagged, skipped {} event(s)", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            _ = tick => log_status(bus).await,
        }
    }
}

async fn log_status(bus: &Bus) {
    for backend in bus.status().await.backends {
        log::info!(
            "[{}] connected={} zones={}{}",
            backend.backend,
            backend.connected,
            backend.zone_count,
            backend
                .last_error
                .map(|e| format!(" last_error={}", e))
                .unwrap_or_default()
        );
    }
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
