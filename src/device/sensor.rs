//! Sensors and the generated kinds used for development and testing.

use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;
use uuid::Uuid;

use super::{
    ComputeError, DeviceRuntime, Reading, ReadOrCompute, Snapshot, StateView, UpdateError,
    ValidationError,
};
use crate::persist::Recorder;
use crate::schema::SchemaRegistry;
use crate::worker::JobHandle;

/// Concrete sensor kinds. Dispatch goes through the tag, not a class
/// hierarchy; `Custom` is the seam for real hardware readers.
pub enum SensorKind {
    RandomValues(RandomValues),
    SineWave(SineWave),
    Custom {
        kind: String,
        reader: Arc<dyn ReadOrCompute>,
    },
}

impl SensorKind {
    /// Kind identifier, also the basis for the derived table names.
    pub fn kind_id(&self) -> &str {
        match self {
            SensorKind::RandomValues(_) => "random_values",
            SensorKind::SineWave(_) => "sine_wave",
            SensorKind::Custom { kind, .. } => kind,
        }
    }
}

impl ReadOrCompute for SensorKind {
    fn read_or_compute(&self, setpoint: Option<f64>) -> Result<Vec<Reading>, ComputeError> {
        match self {
            SensorKind::RandomValues(sensor) => sensor.read(),
            SensorKind::SineWave(sensor) => sensor.read(),
            SensorKind::Custom { reader, .. } => reader.read_or_compute(setpoint),
        }
    }
}

/// Generates two independent values in [0, 1). Dev/test stand-in for a
/// two-channel hardware sensor.
#[derive(Clone, Debug, Default)]
pub struct RandomValues;

impl RandomValues {
    pub fn read(&self) -> Result<Vec<Reading>, ComputeError> {
        let mut rng = rand::thread_rng();
        Ok((0..2)
            .map(|i| Reading::new(format!("value_{}", i), rng.gen::<f64>()))
            .collect())
    }
}

/// Bounded sine-wave generator.
///
/// Output at elapsed time `t` since construction is
/// `min + (max - min) / 2 * (1 + sin(2π * t / period))`, so the value always
/// stays within `[min, max]`.
#[derive(Clone, Debug)]
pub struct SineWave {
    period_secs: f64,
    min: f64,
    max: f64,
    started_at: Instant,
}

impl SineWave {
    /// Fails if `period_secs` is not positive or `max` is not strictly
    /// greater than `min`.
    pub fn new(period_secs: f64, min: f64, max: f64) -> Result<Self, ValidationError> {
        if !(period_secs > 0.0) {
            return Err(ValidationError::NonPositivePeriod(period_secs));
        }
        if !(max > min) {
            return Err(ValidationError::InvertedRange { min, max });
        }
        Ok(Self {
            period_secs,
            min,
            max,
            started_at: Instant::now(),
        })
    }

    pub(crate) fn value_at(&self, elapsed_secs: f64) -> f64 {
        self.min
            + (self.max - self.min) / 2.0
                * (1.0 + (2.0 * PI * elapsed_secs / self.period_secs).sin())
    }

    pub fn read(&self) -> Result<Vec<Reading>, ComputeError> {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        Ok(vec![Reading::new("value", self.value_at(elapsed))])
    }
}

/// A device that produces readings on demand.
pub struct Sensor {
    runtime: DeviceRuntime,
}

impl Sensor {
    /// Registers the kind's schema and the device row, and spawns the
    /// sensor's worker. Must be called from within a Tokio runtime.
    pub fn new(
        name: impl Into<String>,
        kind: SensorKind,
        attributes: Value,
        schemas: &SchemaRegistry,
        recorder: Recorder,
    ) -> anyhow::Result<Self> {
        let kind = Arc::new(kind);
        let kind_id = kind.kind_id().to_string();
        let runtime = DeviceRuntime::initialize(
            name.into(),
            &kind_id,
            kind,
            attributes,
            schemas,
            recorder,
        )?;
        Ok(Self { runtime })
    }

    /// Queues one read-and-persist cycle and returns immediately. A failed
    /// cycle is logged and leaves the cached value untouched; it never
    /// reaches the caller.
    pub fn update(&self) -> Result<JobHandle, UpdateError> {
        self.runtime.submit(None)
    }

    /// Synchronous mode: runs a full cycle and returns the committed
    /// snapshot, or the error that aborted it.
    pub async fn update_wait(&self) -> Result<Arc<Snapshot>, UpdateError> {
        self.runtime.submit_wait(None).await
    }

    /// Cached value of the most recent committed cycle; `None` until the
    /// first success after process start.
    pub fn current_value(&self) -> Option<StateView> {
        self.runtime.core.state_view()
    }

    pub fn id(&self) -> Uuid {
        self.runtime.core.id()
    }

    pub fn name(&self) -> &str {
        self.runtime.core.name()
    }

    pub fn kind(&self) -> &str {
        self.runtime.core.kind()
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.runtime.core.last_update()
    }

    pub fn latest_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.runtime.core.latest_snapshot()
    }

    /// Tears the sensor down, letting queued cycles finish first.
    pub async fn close(self) {
        self.runtime.close().await;
    }
}
