//! Persistence coordinator.
//!
//! Turns a completed read/compute cycle into one committed collection and
//! publishes the result to the device's cache. Runs only from inside a
//! device's worker, so commits for one device are naturally serialized and
//! its collection timestamps are monotonically non-decreasing.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::device::{DeviceCore, Reading, Snapshot, UpdateError};
use crate::store::TelemetryStore;

/// Commits cycles and maintains the cached latest snapshot.
///
/// The snapshot swap happens strictly after the storage commit succeeds;
/// this is the only writer of the cache, so a failed cycle is invisible to
/// readers.
#[derive(Clone)]
pub struct Recorder {
    store: Arc<TelemetryStore>,
}

impl Recorder {
    pub fn new(store: Arc<TelemetryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<TelemetryStore> {
        &self.store
    }

    /// Persists one collection+values tuple for the device and, on success,
    /// replaces the cached snapshot.
    pub fn commit(
        &self,
        core: &DeviceCore,
        readings: Vec<Reading>,
    ) -> Result<Arc<Snapshot>, UpdateError> {
        let recorded_at = Utc::now();
        self.store
            .insert_collection(core.schema(), core.id(), recorded_at, &readings)
            .map_err(|e| UpdateError::Persistence(format!("{:#}", e)))?;

        let snapshot = Arc::new(Snapshot {
            recorded_at,
            values: readings,
        });
        core.publish(Arc::clone(&snapshot));

        debug!(
            device = %core.name(),
            values = snapshot.values.len(),
            "update cycle committed"
        );
        Ok(snapshot)
    }
}
