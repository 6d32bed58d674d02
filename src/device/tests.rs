use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use super::equipment::{BinaryEquipment, Equipment, EquipmentKind};
use super::sensor::{RandomValues, Sensor, SensorKind, SineWave};
use super::{ComputeError, Reading, ReadOrCompute, StateView, UpdateError, ValidationError};
use crate::persist::Recorder;
use crate::schema::SchemaRegistry;
use crate::store::TelemetryStore;

fn harness() -> (SchemaRegistry, Recorder) {
    let store = Arc::new(TelemetryStore::in_memory().expect("in-memory store failed"));
    (
        SchemaRegistry::new(Arc::clone(&store)),
        Recorder::new(store),
    )
}

/// Reader that fails every read after the first.
struct FlakyReader {
    failed: AtomicBool,
}

impl FlakyReader {
    fn new() -> Self {
        Self {
            failed: AtomicBool::new(false),
        }
    }
}

impl ReadOrCompute for FlakyReader {
    fn read_or_compute(&self, _setpoint: Option<f64>) -> Result<Vec<Reading>, ComputeError> {
        if self.failed.swap(true, Ordering::SeqCst) {
            Err(ComputeError::new("i2c bus unreachable"))
        } else {
            Ok(vec![Reading::new("value", 42.0)])
        }
    }
}

#[test]
fn test_state_view_scalar_for_single_value() {
    let view = StateView::from_values(&[Reading::new("state", 1.0)]);
    assert_eq!(view, StateView::Scalar(1.0));
    assert_eq!(view.scalar(), Some(1.0));
}

#[test]
fn test_state_view_named_for_multiple_values() {
    let view = StateView::from_values(&[
        Reading::new("value_0", 0.25),
        Reading::new("value_1", 0.75),
    ]);
    match view {
        StateView::Named(map) => {
            assert_eq!(map.len(), 2);
            assert_eq!(map["value_0"], 0.25);
            assert_eq!(map["value_1"], 0.75);
        }
        other => panic!("expected Named view, got {:?}", other),
    }
}

#[test]
fn test_binary_coercion() {
    let tests = [
        (0.0, 0.0),
        (0.1, 0.0),
        (0.4, 0.0),
        (-1.0, 0.0),
        (0.5, 1.0),
        (0.6, 1.0),
        (0.9, 1.0),
        (5.0, 1.0),
    ];
    for (setpoint, expected) in tests {
        assert_eq!(
            BinaryEquipment::coerce(setpoint),
            expected,
            "coercion of {} should be {}",
            setpoint,
            expected
        );
    }
    assert_eq!(BinaryEquipment::coerce(f64::NAN), 0.0);
}

#[test]
fn test_binary_drive_names_value() {
    let equipment = BinaryEquipment::new("output");
    let readings = equipment.drive(0.7).expect("drive failed");
    assert_eq!(readings, vec![Reading::new("output", 1.0)]);

    let default = BinaryEquipment::default();
    let readings = default.drive(0.0).expect("drive failed");
    assert_eq!(readings[0].name, "state");
}

#[test]
fn test_equipment_kind_requires_setpoint() {
    let kind = EquipmentKind::Binary(BinaryEquipment::default());
    assert!(kind.read_or_compute(None).is_err());
    assert!(kind.read_or_compute(Some(1.0)).is_ok());
}

#[test]
fn test_random_values_read() {
    let sensor = RandomValues;
    let readings = sensor.read().expect("read failed");
    assert_eq!(readings.len(), 2);
    for (i, reading) in readings.iter().enumerate() {
        assert_eq!(reading.name, format!("value_{}", i));
        assert!(
            (0.0..1.0).contains(&reading.value),
            "value {} out of [0, 1)",
            reading.value
        );
    }
}

#[test]
fn test_sine_wave_validation() {
    assert_eq!(
        SineWave::new(0.0, -2.0, 10.0).unwrap_err(),
        ValidationError::NonPositivePeriod(0.0)
    );
    assert_eq!(
        SineWave::new(-1.0, -2.0, 10.0).unwrap_err(),
        ValidationError::NonPositivePeriod(-1.0)
    );
    assert_eq!(
        SineWave::new(0.1, 10.0, -2.0).unwrap_err(),
        ValidationError::InvertedRange {
            min: 10.0,
            max: -2.0
        }
    );
    assert_eq!(
        SineWave::new(0.1, 3.0, 3.0).unwrap_err(),
        ValidationError::InvertedRange { min: 3.0, max: 3.0 }
    );
    assert!(SineWave::new(0.1, -2.0, 10.0).is_ok());
}

#[test]
fn test_sine_wave_shape() {
    let sensor = SineWave::new(0.1, -2.0, 10.0).expect("construction failed");

    // Midpoint at t = 0, extrema a quarter and three quarters in
    assert!((sensor.value_at(0.0) - 4.0).abs() < 1e-9);
    assert!((sensor.value_at(0.025) - 10.0).abs() < 1e-9);
    assert!((sensor.value_at(0.075) - (-2.0)).abs() < 1e-9);

    // One full period apart the wave repeats
    assert!((sensor.value_at(0.13) - sensor.value_at(0.23)).abs() < 1e-9);

    // Bounded everywhere
    for i in 0..200 {
        let value = sensor.value_at(i as f64 * 0.001);
        assert!((-2.0..=10.0).contains(&value), "value {} out of bounds", value);
    }

    // Reads nearly a period apart stay close; a quarter period moves the
    // value measurably
    assert!((sensor.value_at(0.095) - sensor.value_at(0.0)).abs() < 2.0);
    assert!((sensor.value_at(0.025) - sensor.value_at(0.0)).abs() > 1.0);
}

#[test]
fn test_sine_wave_read_moves_with_time() {
    let period = 0.1;
    let (min, max) = (-2.0, 10.0);
    let sensor = SineWave::new(period, min, max).expect("construction failed");

    let first = sensor.read().expect("read failed")[0].value;
    std::thread::sleep(Duration::from_secs_f64(period * 0.3));
    let second = sensor.read().expect("read failed")[0].value;

    assert!((min..=max).contains(&first));
    assert!((min..=max).contains(&second));
    assert!(
        (second - first).abs() > 1.0,
        "value {} should have moved away from {}",
        second,
        first
    );
}

#[tokio::test]
async fn test_update_commits_and_caches() {
    let (schemas, recorder) = harness();
    let sensor = Sensor::new(
        "random",
        SensorKind::RandomValues(RandomValues),
        serde_json::Value::Null,
        &schemas,
        recorder.clone(),
    )
    .expect("sensor construction failed");

    assert!(sensor.current_value().is_none());
    assert!(sensor.last_update().is_none());

    let started = Utc::now();
    let snapshot = sensor.update_wait().await.expect("update failed");
    assert_eq!(snapshot.values.len(), 2);
    assert!(snapshot.recorded_at >= started);

    // Cache mirrors exactly what was committed
    let schema = schemas.register("random_values").unwrap();
    let stored = recorder
        .store()
        .latest_collection(&schema, sensor.id())
        .unwrap()
        .expect("collection not stored");
    assert_eq!(stored.values, snapshot.values);
    assert_eq!(sensor.latest_snapshot().unwrap().values, stored.values);

    sensor.close().await;
}

#[tokio::test]
async fn test_set_updates_current_state() {
    let (schemas, recorder) = harness();
    let relay = Equipment::new(
        "relay",
        EquipmentKind::Binary(BinaryEquipment::default()),
        serde_json::Value::Null,
        &schemas,
        recorder,
    )
    .expect("equipment construction failed");

    relay.set_wait(0.7).await.expect("set failed");
    assert_eq!(relay.current_state(), Some(StateView::Scalar(1.0)));

    relay.set_wait(0.2).await.expect("set failed");
    assert_eq!(relay.current_state(), Some(StateView::Scalar(0.0)));

    relay.close().await;
}

#[tokio::test]
async fn test_failed_compute_is_invisible_to_readers() {
    let (schemas, recorder) = harness();
    let sensor = Sensor::new(
        "flaky",
        SensorKind::Custom {
            kind: "flaky_probe".to_string(),
            reader: Arc::new(FlakyReader::new()),
        },
        serde_json::Value::Null,
        &schemas,
        recorder.clone(),
    )
    .expect("sensor construction failed");

    // First cycle succeeds and seeds the cache
    sensor.update_wait().await.expect("first update failed");
    let before = sensor.latest_snapshot().expect("no snapshot");
    let last_update = sensor.last_update();

    // Second cycle fails during the read; cache must be bit-identical
    let result = sensor.update_wait().await;
    assert!(matches!(result, Err(UpdateError::Compute(_))));
    let after = sensor.latest_snapshot().expect("snapshot disappeared");
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(sensor.last_update(), last_update);

    // Storage saw exactly one collection
    let schema = schemas.register("flaky_probe").unwrap();
    assert_eq!(
        recorder.store().collection_count(&schema, sensor.id()).unwrap(),
        1
    );

    sensor.close().await;
}

#[tokio::test]
async fn test_device_row_recorded_on_construction() {
    let (schemas, recorder) = harness();
    let attributes = json!({ "pin": 4, "bus": "i2c-1" });
    let sensor = Sensor::new(
        "greenhouse",
        SensorKind::SineWave(SineWave::new(60.0, -2.0, 10.0).unwrap()),
        attributes.clone(),
        &schemas,
        recorder.clone(),
    )
    .expect("sensor construction failed");

    let record = recorder
        .store()
        .load_device("greenhouse")
        .unwrap()
        .expect("device row missing");
    assert_eq!(record.id, sensor.id());
    assert_eq!(record.kind, "sine_wave");
    assert_eq!(record.attributes, attributes);

    sensor.close().await;
}
