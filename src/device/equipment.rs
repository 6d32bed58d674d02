//! Equipment: devices that accept commands and record the state they took.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::{
    ComputeError, DeviceRuntime, Reading, ReadOrCompute, Snapshot, StateView, UpdateError,
};
use crate::persist::Recorder;
use crate::schema::SchemaRegistry;
use crate::worker::JobHandle;

/// Concrete equipment kinds. `Custom` is the seam for real actuators.
pub enum EquipmentKind {
    Binary(BinaryEquipment),
    Custom {
        kind: String,
        driver: Arc<dyn ReadOrCompute>,
    },
}

impl EquipmentKind {
    pub fn kind_id(&self) -> &str {
        match self {
            EquipmentKind::Binary(_) => "binary",
            EquipmentKind::Custom { kind, .. } => kind,
        }
    }
}

impl ReadOrCompute for EquipmentKind {
    fn read_or_compute(&self, setpoint: Option<f64>) -> Result<Vec<Reading>, ComputeError> {
        let setpoint =
            setpoint.ok_or_else(|| ComputeError::new("equipment cycle requires a setpoint"))?;
        match self {
            EquipmentKind::Binary(equipment) => equipment.drive(setpoint),
            EquipmentKind::Custom { driver, .. } => driver.read_or_compute(Some(setpoint)),
        }
    }
}

/// Equipment that is either on (1.0) or off (0.0).
#[derive(Clone, Debug)]
pub struct BinaryEquipment {
    state_name: String,
}

impl BinaryEquipment {
    /// `state_name` names the single value this equipment records.
    pub fn new(state_name: impl Into<String>) -> Self {
        Self {
            state_name: state_name.into(),
        }
    }

    /// Coerces any setpoint to exactly 0.0 or 1.0. The boundary is
    /// inclusive upward: 0.5 and above is on; everything below, negative
    /// inputs and NaN included, is off.
    pub fn coerce(setpoint: f64) -> f64 {
        if setpoint >= 0.5 {
            1.0
        } else {
            0.0
        }
    }

    pub fn drive(&self, setpoint: f64) -> Result<Vec<Reading>, ComputeError> {
        Ok(vec![Reading::new(
            self.state_name.clone(),
            Self::coerce(setpoint),
        )])
    }
}

impl Default for BinaryEquipment {
    fn default() -> Self {
        Self::new("state")
    }
}

/// A device that accepts setpoints.
pub struct Equipment {
    runtime: DeviceRuntime,
}

impl Equipment {
    /// Registers the kind's schema and the device row, and spawns the
    /// equipment's worker. Must be called from within a Tokio runtime.
    pub fn new(
        name: impl Into<String>,
        kind: EquipmentKind,
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

    /// Queues one drive-and-persist cycle toward `setpoint` and returns
    /// immediately. Overlapping calls on the same equipment are executed in
    /// submission order, never concurrently. Failures are logged and leave
    /// the cached state untouched.
    pub fn set(&self, setpoint: f64) -> Result<JobHandle, UpdateError> {
        self.runtime.submit(Some(setpoint))
    }

    /// Synchronous mode: drives to `setpoint`, waits for the commit, and
    /// returns the snapshot or the error that aborted the cycle.
    pub async fn set_wait(&self, setpoint: f64) -> Result<Arc<Snapshot>, UpdateError> {
        self.runtime.submit_wait(Some(setpoint)).await
    }

    /// Cached state of the most recent committed cycle; `None` until the
    /// first success after process start.
    pub fn current_state(&self) -> Option<StateView> {
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

    /// Tears the equipment down, letting queued cycles finish first.
    pub async fn close(self) {
        self.runtime.close().await;
    }
}
