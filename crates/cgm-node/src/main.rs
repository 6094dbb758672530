//! CGM Node - follows a Dexcom G7 sensor from the command line
//!
//! This binary wires the btleplug transport to the sensor client and logs:
//! - Connection and scanning status
//! - Glucose readings with their absolute timestamps
//! - Backfilled readings recovered after a disconnect
//!
//! The first sensor offered is accepted. When the sensor appears to have
//! ended its session, the node forgets it and scans for a replacement.

mod delegate;

use anyhow::Context;
use cgm_ble::lifecycle::{lifecycle_state, reading_date, sync_identifier};
use cgm_ble::{BackfillFrame, CgmConfig, G7Sensor, GlucoseFrame};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use delegate::{LoggingDelegate, NodeEvent};

#[derive(Parser)]
#[command(name = "cgm-node")]
#[command(about = "Follow a Dexcom G7 sensor and log its readings")]
struct Args {
    /// JSON configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Name of a previously paired sensor (e.g. DXCM4Q)
    #[arg(long, short)]
    sensor_id: Option<String>,

    /// Delay before rescanning after a disconnect (e.g. "5s")
    #[arg(long, value_parser = humantime::parse_duration)]
    rescan_delay: Option<Duration>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

impl Args {
    /// Configuration file overlaid with command-line flags
    fn load_config(&self) -> anyhow::Result<CgmConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => CgmConfig::default(),
        };

        if let Some(sensor_id) = &self.sensor_id {
            config.sensor.sensor_id = Some(sensor_id.clone());
        }
        if let Some(delay) = self.rescan_delay {
            config.scanner.rescan_delay = delay;
        }
        config.validate()?;
        Ok(config)
    }
}

#[cfg(feature = "ble")]
async fn open_transport() -> anyhow::Result<(
    Arc<dyn cgm_ble::BleTransport>,
    tokio::sync::mpsc::UnboundedReceiver<cgm_ble::TransportEvent>,
)> {
    let (transport, events) = cgm_ble::BtleplugTransport::new()
        .await
        .context("opening Bluetooth adapter")?;
    Ok((transport, events))
}

#[cfg(not(feature = "ble"))]
async fn open_transport() -> anyhow::Result<(
    Arc<dyn cgm_ble::BleTransport>,
    tokio::sync::mpsc::UnboundedReceiver<cgm_ble::TransportEvent>,
)> {
    anyhow::bail!("cgm-node was built without Bluetooth support; rebuild with `--features ble`")
}

fn log_reading(sensor: &G7Sensor, reading: &GlucoseFrame) {
    let sensor_id = sensor.sensor_id();
    let activated_at = sensor.activation_date();
    let timestamp = reading.glucose_timestamp();

    info!(
        glucose = ?reading.glucose,
        trend = reading.trend_type().map(|t| t.arrow()),
        algorithm_state = ?reading.algorithm_state,
        reliable = reading.has_reliable_glucose(),
        at = ?activated_at.map(|at| reading_date(at, timestamp)),
        sync_id = %sync_identifier(activated_at, sensor_id.as_deref(), timestamp),
        lifecycle = ?lifecycle_state(
            sensor_id.as_deref(),
            activated_at,
            Some(reading.algorithm_state),
            Utc::now(),
        ),
        "Glucose reading"
    );
}

fn log_backfill(sensor: &G7Sensor, backfill: &[BackfillFrame]) {
    let sensor_id = sensor.sensor_id();
    let activated_at = sensor.activation_date();

    info!(count = backfill.len(), "Backfill received");
    for entry in backfill {
        info!(
            glucose = ?entry.glucose,
            reliable = entry.has_reliable_glucose(),
            at = ?activated_at.map(|at| reading_date(at, entry.timestamp)),
            sync_id = %sync_identifier(activated_at, sensor_id.as_deref(), entry.timestamp),
            "Backfilled reading"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = args.load_config()?;
    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    match &config.sensor.sensor_id {
        Some(sensor_id) => info!(sensor = %sensor_id, "Starting CGM node"),
        None => info!("Starting CGM node, waiting for a new sensor"),
    }

    let (transport, events) = open_transport().await?;
    let (delegate, mut node_events) = LoggingDelegate::new();
    let sensor = G7Sensor::new(transport, events, config, Arc::new(delegate))?;
    sensor.resume_scanning().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            Some(event) = node_events.recv() => match event {
                NodeEvent::Reading(reading) => log_reading(&sensor, &reading),
                NodeEvent::Backfill(backfill) => log_backfill(&sensor, &backfill),
                NodeEvent::SessionEnded => {
                    info!("Sensor session appears to have ended, scanning for a new sensor");
                    if let Err(e) = sensor.scan_for_new_sensor(true).await {
                        warn!(error = %e, "Failed to start scanning for a new sensor");
                    }
                }
            },
        }
    }

    sensor.stop_scanning().await?;
    sensor.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_overlay_defaults() {
        let args = Args::parse_from([
            "cgm-node",
            "--sensor-id",
            "DXCM4Q",
            "--rescan-delay",
            "10s",
        ]);
        let config = args.load_config().unwrap();
        assert_eq!(config.sensor.sensor_id.as_deref(), Some("DXCM4Q"));
        assert_eq!(config.scanner.rescan_delay, Duration::from_secs(10));
        assert_eq!(config.session.command_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_missing_config_file() {
        let args = Args::parse_from(["cgm-node", "--config", "/nonexistent/cgm.json"]);
        assert!(args.load_config().is_err());
    }
}
