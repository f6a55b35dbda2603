//! End to end runs of the engine against a simulated bus.

use chrono::Utc;
use cu_servobus::sim::{SimHandle, SimulatedBus};
use cu_servobus::{
    BusConfig, CalibrationPoint, CalibrationSet, CalibrationStore, Engine, JsonFileStore,
    MemoryStore, PointName, Register, RetryPolicy, ServoBus, ServoBusError, ServoId,
};
use std::collections::BTreeMap;
use std::time::Duration;

const IDS: [ServoId; 3] = [1, 2, 3];

fn config(attempts: u32) -> BusConfig {
    let mut config = BusConfig::new("sim", IDS.to_vec());
    config.retry = RetryPolicy {
        max_attempts: attempts,
        backoff: Duration::ZERO,
    };
    config
}

fn committed() -> CalibrationSet {
    CalibrationSet {
        timestamp: Utc::now(),
        servos: IDS
            .iter()
            .map(|&id| (id, CalibrationPoint { zero: 2048, min: 1024, max: 3072 }))
            .collect(),
    }
}

fn engine_with(store: impl CalibrationStore + 'static, attempts: u32) -> (Engine<SimulatedBus>, SimHandle) {
    let sim = SimulatedBus::with_servos(&IDS);
    let handle = sim.handle();
    let bus = ServoBus::new(config(attempts), sim, store).unwrap();
    (Engine::new(bus), handle)
}

fn calibrate_all(engine: &Engine<SimulatedBus>, sim: &SimHandle, zero: u16, min: u16, max: u16) {
    engine.start_calibration().unwrap();
    for (point, raw) in [(PointName::Zero, zero), (PointName::Min, min), (PointName::Max, max)] {
        for id in IDS {
            sim.set_present_position(id, raw);
            assert_eq!(engine.set_calibration_point(id, point, None).unwrap(), raw as i32);
        }
    }
}

#[test]
fn full_calibration_session_commits_and_persists() {
    let store = MemoryStore::default();
    let (engine, sim) = engine_with(store.clone(), 3);
    engine.connect().unwrap();
    assert!(matches!(engine.get_angles(), Err(ServoBusError::NotCalibrated(ids)) if ids == IDS));

    calibrate_all(&engine, &sim, 2000, 3000, 1000);
    let set = engine.end_calibration().unwrap();
    assert_eq!(store.save_count(), 1);
    assert_eq!(store.saved(), Some(set.clone()));
    assert_eq!(engine.calibration(), Some(set));
    assert!(engine.get_torque());
    assert!(!engine.is_calibrating());

    // Servos were calibrated reversed: raw 1500 is +45°.
    engine.set_angle(&BTreeMap::from([(1, 45.0)])).unwrap();
    assert_eq!(sim.register(1, Register::GoalPosition), 1500);
    assert_eq!(engine.get_angles().unwrap()[&1], 45.0);
}

#[test]
fn incomplete_calibration_leaves_committed_untouched() {
    let before = committed();
    let store = MemoryStore::new(Some(before.clone()));
    let (engine, _sim) = engine_with(store.clone(), 3);
    engine.connect().unwrap();
    engine.start_calibration().unwrap();
    engine.set_calibration_point(1, PointName::Zero, Some(100)).unwrap();
    engine.set_calibration_point(1, PointName::Min, Some(50)).unwrap();

    match engine.end_calibration() {
        Err(ServoBusError::IncompleteCalibration { missing }) => {
            assert_eq!(missing[0], (1, PointName::Max));
            assert_eq!(missing.len(), 7);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(engine.is_calibrating());
    assert_eq!(engine.calibration(), Some(before));
    assert_eq!(engine.draft_calibration().unwrap().servos[&1].zero, Some(100));
    assert_eq!(store.save_count(), 0);
}

#[test]
fn cancel_restores_previous_state() {
    let before = committed();
    let (engine, sim) = engine_with(MemoryStore::new(Some(before.clone())), 3);
    engine.connect().unwrap();
    engine.set_torque(true).unwrap();
    engine.start_calibration().unwrap();
    assert_eq!(sim.register(2, Register::TorqueEnable), 0);
    engine.set_calibration_point(2, PointName::Zero, Some(10)).unwrap();

    engine.cancel_calibration().unwrap();
    assert_eq!(engine.calibration(), Some(before));
    assert!(engine.draft_calibration().is_none());
    assert!(engine.get_torque());
    assert_eq!(sim.register(2, Register::TorqueEnable), 1);
}

#[test]
fn failing_bus_gives_up_after_the_retry_budget() {
    let (engine, sim) = engine_with(MemoryStore::new(Some(committed())), 4);
    engine.connect().unwrap();
    engine.set_torque(true).unwrap();
    sim.reset_counters();
    sim.fail_always(true);

    match engine.set_angle(&BTreeMap::from([(1, 10.0), (2, 20.0)])) {
        Err(ServoBusError::Communication { register, attempts, .. }) => {
            assert_eq!(register, "Goal_Position");
            assert_eq!(attempts, 4);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(sim.exchange_count(), 4);
    assert!(engine.is_connected());
}

#[test]
fn transient_failures_are_absorbed() {
    let (engine, sim) = engine_with(MemoryStore::new(Some(committed())), 5);
    engine.connect().unwrap();
    sim.set_present_position(3, 2560);
    sim.fail_next(2);
    let positions = engine.get_positions().unwrap();
    assert_eq!(positions[&3], 2560);
    assert_eq!(positions.len(), 3);
}

#[test]
fn reconnect_after_disconnect() {
    let (engine, sim) = engine_with(MemoryStore::default(), 3);
    engine.connect().unwrap();
    engine.set_torque(true).unwrap();
    engine.disconnect().unwrap();
    assert!(!engine.is_connected());
    assert!(!engine.get_torque());
    assert!(matches!(engine.get_positions(), Err(ServoBusError::NotConnected)));

    engine.connect().unwrap();
    assert_eq!(sim.open_count(), 2);
    assert!(!engine.get_torque());
    assert_eq!(engine.get_positions().unwrap().len(), 3);
}

#[test]
fn disconnect_mid_calibration_drops_the_draft() {
    let (engine, _sim) = engine_with(MemoryStore::default(), 3);
    engine.connect().unwrap();
    engine.start_calibration().unwrap();
    engine.set_calibration_point(1, PointName::Zero, Some(2048)).unwrap();
    engine.disconnect().unwrap();
    assert!(engine.draft_calibration().is_none());
    assert!(!engine.is_calibrating());
}

#[test]
fn status_reflects_the_session() {
    let (engine, _sim) = engine_with(MemoryStore::new(Some(committed())), 3);
    let status = engine.status();
    assert!(!status.state.is_connected());
    assert!(status.calibrated);
    assert_eq!(status.servo_ids, IDS.to_vec());

    engine.connect().unwrap();
    engine.start_calibration().unwrap();
    let json = serde_json::to_value(engine.status()).unwrap();
    assert_eq!(json["state"]["calibration"], "in_progress");
    assert_eq!(json["state"]["connected"], true);
}

#[test]
fn center_sends_every_joint_to_zero() {
    let mut set = committed();
    set.servos.insert(2, CalibrationPoint { zero: 1800, min: 900, max: 2900 });
    let (engine, sim) = engine_with(MemoryStore::new(Some(set)), 3);
    engine.connect().unwrap();
    engine.set_torque(true).unwrap();
    engine.center().unwrap();
    assert_eq!(sim.register(1, Register::GoalPosition), 2048);
    assert_eq!(sim.register(2, Register::GoalPosition), 1800);
    assert_eq!(sim.register(3, Register::GoalPosition), 2048);
}

#[test]
fn calibration_survives_a_restart_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arm").join("calibration.json");

    {
        let (engine, sim) = engine_with(JsonFileStore::new(&path), 3);
        engine.connect().unwrap();
        calibrate_all(&engine, &sim, 2048, 1024, 3072);
        engine.end_calibration().unwrap();
    }
    assert!(path.exists());

    let (engine, sim) = engine_with(JsonFileStore::new(&path), 3);
    engine.connect().unwrap();
    sim.set_present_position(2, 1536);
    assert_eq!(engine.get_angles().unwrap()[&2], -45.0);

    let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(json["servos"]["2"]["zero"], 2048);
    assert_eq!(json["servos"]["2"]["min"], 1024);
    assert!(json["timestamp"].is_string());
}

#[test]
fn corrupt_calibration_file_starts_uncalibrated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibration.json");
    std::fs::write(&path, "{ not json").unwrap();

    let (engine, _sim) = engine_with(JsonFileStore::new(&path), 3);
    assert!(engine.calibration().is_none());
    engine.connect().unwrap();
    assert!(matches!(engine.get_angles(), Err(ServoBusError::NotCalibrated(_))));
}
