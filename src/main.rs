use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{info, warn};

use atrium::config::{load_config, AtriumConfig};
use atrium::device::equipment::{BinaryEquipment, Equipment, EquipmentKind};
use atrium::device::sensor::{RandomValues, Sensor, SensorKind, SineWave};
use atrium::persist::Recorder;
use atrium::schema::SchemaRegistry;
use atrium::store::TelemetryStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "atrium=info".into()),
        )
        .init();

    info!("Atrium starting...");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "atrium.toml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        load_config(&config_path)
            .map_err(|e| anyhow::anyhow!("Failed to load config '{}': {}", config_path, e))?
    } else {
        info!(path = %config_path, "No config file found, using defaults");
        AtriumConfig::default()
    };

    let store = Arc::new(
        TelemetryStore::open(&config.database.path).context("Failed to open telemetry store")?,
    );
    let schemas = SchemaRegistry::new(Arc::clone(&store));
    let recorder = Recorder::new(Arc::clone(&store));
    info!(database = %config.database.path, "Telemetry store opened");

    // Generated devices stand in for real hardware
    let random = Sensor::new(
        "bench-random",
        SensorKind::RandomValues(RandomValues),
        serde_json::Value::Null,
        &schemas,
        recorder.clone(),
    )
    .context("Failed to create random sensor")?;

    let sine = Sensor::new(
        "bench-sine",
        SensorKind::SineWave(SineWave::new(60.0, -2.0, 10.0)?),
        json!({ "period_secs": 60.0, "min": -2.0, "max": 10.0 }),
        &schemas,
        recorder.clone(),
    )
    .context("Failed to create sine sensor")?;

    let relay = Equipment::new(
        "bench-relay",
        EquipmentKind::Binary(BinaryEquipment::default()),
        serde_json::Value::Null,
        &schemas,
        recorder,
    )
    .context("Failed to create relay")?;

    info!(
        interval_seconds = config.poll.interval_seconds,
        "Polling generated devices"
    );

    let mut interval = tokio::time::interval(Duration::from_secs(config.poll.interval_seconds));
    let mut relay_on = false;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = random.update() {
                    warn!(device = %random.name(), error = %e, "Failed to queue update");
                }
                if let Err(e) = sine.update() {
                    warn!(device = %sine.name(), error = %e, "Failed to queue update");
                }
                relay_on = !relay_on;
                if let Err(e) = relay.set(if relay_on { 1.0 } else { 0.0 }) {
                    warn!(device = %relay.name(), error = %e, "Failed to queue setpoint");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    // Let in-flight cycles finish before exiting
    random.close().await;
    sine.close().await;
    relay.close().await;
    info!("Atrium stopped");

    Ok(())
}
