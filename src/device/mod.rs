use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::persist::Recorder;
use crate::schema::{KindSchema, SchemaRegistry};
use crate::store::DeviceRecord;
use crate::worker::{CompleteFn, JobHandle, WorkFn, Worker};

pub mod equipment;
pub mod sensor;

#[cfg(test)]
mod tests;

/// One named numeric datum produced by a device read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub name: String,
    pub value: f64,
}

impl Reading {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// The values of one committed collection, cached in memory.
///
/// A snapshot is only ever built from values that have already been persisted,
/// so readers of the cache can never observe an uncommitted cycle.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub recorded_at: DateTime<Utc>,
    pub values: Vec<Reading>,
}

/// Read-side view of a device's cached state.
///
/// Single-value devices surface a bare scalar; multi-value devices surface a
/// name-to-value map.
#[derive(Clone, Debug, PartialEq)]
pub enum StateView {
    Scalar(f64),
    Named(HashMap<String, f64>),
}

impl StateView {
    pub(crate) fn from_values(values: &[Reading]) -> Self {
        if values.len() == 1 {
            StateView::Scalar(values[0].value)
        } else {
            StateView::Named(values.iter().map(|r| (r.name.clone(), r.value)).collect())
        }
    }

    /// Returns the scalar value, if this view holds exactly one.
    pub fn scalar(&self) -> Option<f64> {
        match self {
            StateView::Scalar(v) => Some(*v),
            StateView::Named(_) => None,
        }
    }
}

/// Invalid construction parameters for a device kind
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    NonPositivePeriod(f64),
    InvertedRange { min: f64, max: f64 },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::NonPositivePeriod(p) => {
                write!(f, "period must be positive, got {}", p)
            }
            ValidationError::InvertedRange { min, max } => {
                write!(f, "max ({}) must be strictly greater than min ({})", max, min)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// A failed `read_or_compute` invocation
#[derive(Debug, Clone)]
pub struct ComputeError {
    message: String,
}

impl ComputeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ComputeError {}

/// Outcome of a full update/set cycle (read plus commit)
#[derive(Debug)]
pub enum UpdateError {
    Compute(ComputeError),
    Persistence(String),
    WorkerClosed,
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateError::Compute(e) => write!(f, "compute failed: {}", e),
            UpdateError::Persistence(e) => write!(f, "persistence failed: {}", e),
            UpdateError::WorkerClosed => write!(f, "device worker is closed"),
        }
    }
}

impl std::error::Error for UpdateError {}

impl From<ComputeError> for UpdateError {
    fn from(e: ComputeError) -> Self {
        UpdateError::Compute(e)
    }
}

/// The capability every concrete device kind implements.
///
/// Sensors ignore `setpoint`; equipment computes its next state from it.
/// Implementations run on a blocking worker thread, so they may perform slow
/// hardware I/O, but they must not touch persisted state — they only return
/// readings, and the recorder commits them.
pub trait ReadOrCompute: Send + Sync {
    fn read_or_compute(&self, setpoint: Option<f64>) -> Result<Vec<Reading>, ComputeError>;
}

/// Shared identity and cached state for a device.
///
/// The latest snapshot is written only by the recorder, from inside the
/// device's own worker, after a successful commit. It is read from any
/// thread; the `RwLock`ed `Arc` swap means readers always see a complete
/// snapshot or none at all.
pub struct DeviceCore {
    id: Uuid,
    name: String,
    schema: KindSchema,
    attributes: Value,
    latest: RwLock<Option<Arc<Snapshot>>>,
}

impl DeviceCore {
    pub(crate) fn new(name: String, schema: KindSchema, attributes: Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            name,
            schema,
            attributes,
            latest: RwLock::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind identifier this device was registered under (e.g. "sine_wave")
    pub fn kind(&self) -> &str {
        &self.schema.kind
    }

    /// Opaque kind-specific attributes, never interpreted by the core
    pub fn attributes(&self) -> &Value {
        &self.attributes
    }

    pub(crate) fn schema(&self) -> &KindSchema {
        &self.schema
    }

    /// The most recently committed collection's values, if any cycle has
    /// succeeded since process start.
    pub fn latest_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.latest.read().unwrap().clone()
    }

    /// Timestamp of the last committed cycle
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.latest_snapshot().map(|s| s.recorded_at)
    }

    pub fn state_view(&self) -> Option<StateView> {
        self.latest_snapshot()
            .map(|s| StateView::from_values(&s.values))
    }

    pub(crate) fn publish(&self, snapshot: Arc<Snapshot>) {
        *self.latest.write().unwrap() = Some(snapshot);
    }
}

/// Plumbing shared by `Sensor` and `Equipment`: the core, the kind's I/O
/// implementation, the per-device worker, and the recorder.
pub(crate) struct DeviceRuntime {
    pub(crate) core: Arc<DeviceCore>,
    io: Arc<dyn ReadOrCompute>,
    worker: Worker,
    recorder: Recorder,
}

impl DeviceRuntime {
    /// Registers the kind's schema, records the device row, and spawns the
    /// worker. Must be called from within a Tokio runtime.
    pub(crate) fn initialize(
        name: String,
        kind_id: &str,
        io: Arc<dyn ReadOrCompute>,
        attributes: Value,
        schemas: &SchemaRegistry,
        recorder: Recorder,
    ) -> anyhow::Result<Self> {
        let schema = schemas.register(kind_id)?;
        let core = Arc::new(DeviceCore::new(name, schema, attributes));
        recorder
            .store()
            .upsert_device(&DeviceRecord {
                id: core.id(),
                name: core.name().to_string(),
                kind: core.kind().to_string(),
                attributes: core.attributes().clone(),
                last_update: None,
            })
            .with_context(|| format!("Failed to record device '{}'", core.name()))?;
        let worker = Worker::spawn(core.name().to_string());
        Ok(Self {
            core,
            io,
            worker,
            recorder,
        })
    }

    /// Queues one read-then-commit cycle on the device's worker.
    pub(crate) fn submit(&self, setpoint: Option<f64>) -> Result<JobHandle, UpdateError> {
        let io = Arc::clone(&self.io);
        let work: WorkFn =
            Box::new(move || io.read_or_compute(setpoint).map_err(UpdateError::Compute));

        let core = Arc::clone(&self.core);
        let recorder = self.recorder.clone();
        let on_done: CompleteFn = Box::new(move |readings| recorder.commit(&core, readings));

        self.worker.submit(work, on_done)
    }

    pub(crate) async fn submit_wait(
        &self,
        setpoint: Option<f64>,
    ) -> Result<Arc<Snapshot>, UpdateError> {
        self.submit(setpoint)?.wait().await
    }

    pub(crate) async fn close(self) {
        self.worker.close().await;
    }
}
