//! The servo bus engine.
//!
//! [`ServoBus`] owns the transport, the device state and both calibration
//! slots, and runs every operation to completion on `&mut self`.
//! [`Engine`] wraps it in a single mutex so any number of front ends and
//! poll loops can share one bus without two transactions ever being in
//! flight at once: the protocol has no transaction ids to tell interleaved
//! replies apart.

use crate::calibration::{
    CalibrationSet, CalibrationSlots, CalibrationStore, DraftCalibration, JsonFileStore, PointName,
    RawPosition,
};
use crate::config::BusConfig;
use crate::error::{Result, ServoBusError};
use crate::group::GroupEngine;
use crate::registers::{Register, MAX_POSITION};
use crate::state::DeviceState;
use crate::transport::{BusTransport, SerialTransport};
use crate::ServoId;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A `min` or `max` captured closer than this to `zero` is probably a
/// mistake, most likely the joint was not moved.
pub const MIN_POINT_SEPARATION: RawPosition = 50;

/// Snapshot for front ends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub state: DeviceState,
    pub servo_ids: Vec<ServoId>,
    pub calibrated: bool,
    pub calibrated_at: Option<DateTime<Utc>>,
}

pub struct ServoBus<T: BusTransport> {
    config: BusConfig,
    group: GroupEngine<T>,
    state: DeviceState,
    calibration: CalibrationSlots,
    store: Box<dyn CalibrationStore>,
}

impl<T: BusTransport> ServoBus<T> {
    /// Build a disconnected engine and load the committed calibration.
    ///
    /// An unreadable calibration is logged and treated as absent.
    pub fn new(config: BusConfig, transport: T, store: impl CalibrationStore + 'static) -> Result<Self> {
        config.validate()?;
        let committed = match store.load() {
            Ok(Some(set)) => {
                info!("loaded calibration from {}", set.timestamp);
                if !set.covers(&config.servo_ids) {
                    warn!("loaded calibration does not cover every configured servo");
                }
                Some(set)
            }
            Ok(None) => {
                info!("no saved calibration");
                None
            }
            Err(e) => {
                error!("ignoring saved calibration: {e}");
                None
            }
        };
        Ok(Self {
            group: GroupEngine::new(transport, config.retry),
            config,
            state: DeviceState::default(),
            calibration: CalibrationSlots::new(committed),
            store: Box::new(store),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn servo_ids(&self) -> &[ServoId] {
        &self.config.servo_ids
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn transport(&self) -> &T {
        self.group.transport()
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn is_calibrating(&self) -> bool {
        self.state.is_calibrating()
    }

    pub fn calibration(&self) -> Option<&CalibrationSet> {
        self.calibration.committed()
    }

    pub fn draft_calibration(&self) -> Option<&DraftCalibration> {
        self.calibration.draft()
    }

    pub fn status(&self) -> EngineStatus {
        let committed = self.calibration.committed();
        EngineStatus {
            state: self.state,
            servo_ids: self.config.servo_ids.clone(),
            calibrated: committed.is_some_and(|c| c.covers(&self.config.servo_ids)),
            calibrated_at: committed.map(|c| c.timestamp),
        }
    }

    // =====================================================================
    // Connection
    // =====================================================================

    /// Open the bus and write the bring-up registers to every servo.
    ///
    /// Connecting an already connected engine does nothing, even after a
    /// `Communication` error: the engine does not probe the link. To recover
    /// from a lost link call [`disconnect`](Self::disconnect) first, which
    /// closes the port whether or not the servos answer. On failure the port
    /// is released before the error is returned.
    pub fn connect(&mut self) -> Result<()> {
        if self.state.is_connected() {
            debug!("already connected");
            return Ok(());
        }
        let settings = self.config.serial_settings();
        self.group
            .open(&settings)
            .map_err(|e| ServoBusError::ConnectionFailed(Box::new(e)))?;
        if let Err(e) = self.configure_servos() {
            self.group.close();
            error!("bring-up of {} failed: {e}", settings.path);
            return Err(ServoBusError::ConnectionFailed(Box::new(e)));
        }
        self.state = DeviceState::connected();
        info!("connected to {} servos on {}", self.config.servo_ids.len(), settings.path);
        Ok(())
    }

    fn configure_servos(&mut self) -> Result<()> {
        let g = self.config.gains;
        let ids = self.config.servo_ids.clone();
        let writes = [
            (Register::Mode, g.mode as u32),
            (Register::PCoefficient, g.p as u32),
            (Register::ICoefficient, g.i as u32),
            (Register::DCoefficient, g.d as u32),
            (Register::Lock, 0),
            (Register::MaximumAcceleration, g.max_acceleration as u32),
            (Register::Acceleration, g.acceleration as u32),
        ];
        for (register, value) in writes {
            self.group.broadcast(register.descriptor(), &ids, value)?;
        }
        Ok(())
    }

    /// Release torque if held, then close the port.
    ///
    /// The port is closed even when releasing torque fails; that error is
    /// returned afterwards. Disconnecting twice is harmless. An in-progress
    /// calibration draft is dropped.
    pub fn disconnect(&mut self) -> Result<()> {
        if !self.state.is_connected() {
            return Ok(());
        }
        let released = if self.state.torque_enabled() {
            self.set_torque(false)
        } else {
            Ok(())
        };
        if let Err(e) = &released {
            warn!("could not release torque before closing: {e}");
        }
        if self.calibration.draft().is_some() {
            warn!("disconnecting with a calibration in progress, draft dropped");
            self.calibration.discard_draft();
        }
        self.group.close();
        self.state = DeviceState::default();
        info!("disconnected");
        released
    }

    // =====================================================================
    // Torque and positions
    // =====================================================================

    pub fn set_torque(&mut self, enabled: bool) -> Result<()> {
        self.state.check_torque(enabled)?;
        self.group.broadcast(
            Register::TorqueEnable.descriptor(),
            &self.config.servo_ids,
            enabled as u32,
        )?;
        self.state.set_torque(enabled)?;
        info!("torque {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    pub fn get_torque(&self) -> bool {
        self.state.torque_enabled()
    }

    /// Raw present position of every configured servo.
    pub fn get_positions(&mut self) -> Result<BTreeMap<ServoId, RawPosition>> {
        self.state.require_connected()?;
        self.read_positions()
    }

    fn read_positions(&mut self) -> Result<BTreeMap<ServoId, RawPosition>> {
        let raw = self
            .group
            .group_read(Register::PresentPosition.descriptor(), &self.config.servo_ids)?;
        Ok(raw.into_iter().map(|(id, v)| (id, v as RawPosition)).collect())
    }

    /// Present angle of every configured servo, in degrees.
    pub fn get_angles(&mut self) -> Result<BTreeMap<ServoId, f64>> {
        self.state.require_connected()?;
        let committed = self.require_calibrated(&self.config.servo_ids)?;
        let positions = self.read_positions()?;
        Ok(positions
            .into_iter()
            .filter_map(|(id, pos)| Some((id, committed.get(id)?.position_to_angle(pos))))
            .collect())
    }

    /// Command joints to the given angles in degrees.
    ///
    /// Every precondition is checked before anything is written, so a bad
    /// entry anywhere in `angles` leaves all servos untouched.
    pub fn set_angle(&mut self, angles: &BTreeMap<ServoId, f64>) -> Result<()> {
        self.state.require_connected()?;
        self.check_known(angles.keys())?;
        if let Some((&id, &angle)) = angles.iter().find(|(_, a)| !a.is_finite()) {
            return Err(ServoBusError::InvalidAngle { id, angle });
        }
        let ids: Vec<ServoId> = angles.keys().copied().collect();
        let committed = self.require_calibrated(&ids)?;
        if !self.state.torque_enabled() {
            return Err(ServoBusError::TorqueDisabled);
        }
        let goals: BTreeMap<ServoId, u32> = angles
            .iter()
            .filter_map(|(&id, &angle)| {
                Some((id, committed.get(id)?.angle_to_position(angle)))
            })
            .map(|(id, pos)| (id, goal_value(id, pos)))
            .collect();
        self.group.group_write(Register::GoalPosition.descriptor(), &goals)
    }

    /// Command raw goal positions directly, bypassing calibration.
    pub fn set_positions(&mut self, positions: &BTreeMap<ServoId, RawPosition>) -> Result<()> {
        self.state.require_connected()?;
        self.check_known(positions.keys())?;
        if !self.state.torque_enabled() {
            return Err(ServoBusError::TorqueDisabled);
        }
        let goals: BTreeMap<ServoId, u32> = positions
            .iter()
            .map(|(&id, &pos)| (id, goal_value(id, pos)))
            .collect();
        self.group.group_write(Register::GoalPosition.descriptor(), &goals)
    }

    /// Send every joint to 0°.
    pub fn center(&mut self) -> Result<()> {
        let angles = self.config.servo_ids.iter().map(|&id| (id, 0.0)).collect();
        self.set_angle(&angles)
    }

    /// Angles for a periodic poll, `None` while disconnected or calibrating.
    pub fn poll_angles(&mut self) -> Result<Option<BTreeMap<ServoId, f64>>> {
        if !self.state.is_connected() || self.state.is_calibrating() {
            return Ok(None);
        }
        self.get_angles().map(Some)
    }

    fn check_known<'a>(&self, ids: impl IntoIterator<Item = &'a ServoId>) -> Result<()> {
        match ids.into_iter().find(|id| !self.config.servo_ids.contains(id)) {
            Some(&id) => Err(ServoBusError::UnknownServo(id)),
            None => Ok(()),
        }
    }

    /// Committed calibration, provided it covers every id in `ids`.
    fn require_calibrated(&self, ids: &[ServoId]) -> Result<CalibrationSet> {
        let committed = self.calibration.committed();
        let missing: Vec<ServoId> = ids
            .iter()
            .copied()
            .filter(|&id| committed.and_then(|c| c.get(id)).is_none())
            .collect();
        match committed {
            Some(set) if missing.is_empty() => Ok(set.clone()),
            _ => Err(ServoBusError::NotCalibrated(missing)),
        }
    }

    // =====================================================================
    // Calibration
    // =====================================================================

    /// Release torque and start capturing a new calibration draft.
    ///
    /// Does nothing if a calibration is already in progress.
    pub fn start_calibration(&mut self) -> Result<()> {
        self.state.require_connected()?;
        if self.state.is_calibrating() {
            warn!("calibration already in progress");
            return Ok(());
        }
        self.set_torque(false)?;
        self.calibration.begin();
        self.state.begin_calibration()?;
        info!("calibration started, torque released");
        Ok(())
    }

    /// Record one reference point for a servo.
    ///
    /// Without an explicit `position` the servo's present position is read.
    /// Returns the value stored in the draft.
    pub fn set_calibration_point(
        &mut self,
        id: ServoId,
        point: PointName,
        position: Option<RawPosition>,
    ) -> Result<RawPosition> {
        self.state.require_calibrating()?;
        self.check_known([&id])?;
        let value = match position {
            Some(p) if !(0..=MAX_POSITION).contains(&p) => {
                return Err(ServoBusError::InvalidPosition { id, position: p });
            }
            Some(p) => p,
            None => self
                .group
                .read_one(Register::PresentPosition.descriptor(), id)? as RawPosition,
        };
        if point != PointName::Zero
            && let Some(zero) = self
                .calibration
                .draft()
                .and_then(|d| d.servos.get(&id))
                .and_then(|p| p.zero)
            && value.abs_diff(zero) < MIN_POINT_SEPARATION.unsigned_abs()
        {
            warn!("servo {id}: {point} {value} is within {MIN_POINT_SEPARATION} of zero {zero}");
        }
        self.calibration.record(id, point, value)?;
        info!("servo {id}: {point} = {value}");
        Ok(value)
    }

    /// Validate, persist and commit the draft, then re-enable torque.
    ///
    /// With points missing nothing changes: the session stays open with the
    /// draft intact and `IncompleteCalibration` lists what is missing. A
    /// failed save also leaves the session open and the committed set as it
    /// was. Once committed the set is returned even if torque cannot be
    /// re-enabled; check [`get_torque`](Self::get_torque) in that case.
    pub fn end_calibration(&mut self) -> Result<CalibrationSet> {
        self.state.require_calibrating()?;
        let set = match self.calibration.prepare(&self.config.servo_ids, Utc::now()) {
            Ok(set) => set,
            Err(e) => {
                warn!("not committing calibration: {e}");
                return Err(e);
            }
        };
        self.store.save(&set)?;
        self.calibration.commit(set.clone());
        self.state.end_calibration();
        info!("calibration committed for {} servos", set.servos.len());
        if let Err(e) = self.set_torque(true) {
            error!("calibration committed but torque was not re-enabled: {e}");
        }
        Ok(set)
    }

    /// Drop the draft, keep the committed set, and re-enable torque.
    pub fn cancel_calibration(&mut self) -> Result<()> {
        self.state.require_calibrating()?;
        self.calibration.discard_draft();
        self.state.end_calibration();
        info!("calibration cancelled");
        self.set_torque(true)
    }
}

impl<T: BusTransport> Drop for ServoBus<T> {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            warn!("disconnect on drop: {e}");
        }
    }
}

fn goal_value(id: ServoId, position: RawPosition) -> u32 {
    let clamped = position.clamp(0, MAX_POSITION);
    if clamped != position {
        warn!("servo {id}: goal {position} clamped to {clamped}");
    }
    clamped as u32
}

/// Shared handle to a [`ServoBus`], serializing all access behind one lock.
pub struct Engine<T: BusTransport> {
    inner: Arc<Mutex<ServoBus<T>>>,
}

impl<T: BusTransport> Clone for Engine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Engine<SerialTransport> {
    /// Engine on a host serial port with calibration in the configured JSON file.
    pub fn open_serial(config: BusConfig) -> Result<Self> {
        let store = JsonFileStore::new(config.calibration_file.clone());
        Ok(Self::new(ServoBus::new(config, SerialTransport::new(), store)?))
    }
}

impl<T: BusTransport> Engine<T> {
    pub fn new(bus: ServoBus<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(bus)),
        }
    }

    /// Hold the bus for a sequence of operations that must not interleave.
    pub fn lock(&self) -> MutexGuard<'_, ServoBus<T>> {
        self.inner.lock()
    }

    /// See [`ServoBus::connect`]; after a lost link, disconnect first.
    pub fn connect(&self) -> Result<()> {
        self.lock().connect()
    }

    pub fn disconnect(&self) -> Result<()> {
        self.lock().disconnect()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().is_connected()
    }

    pub fn is_calibrating(&self) -> bool {
        self.lock().is_calibrating()
    }

    pub fn status(&self) -> EngineStatus {
        self.lock().status()
    }

    pub fn servo_ids(&self) -> Vec<ServoId> {
        self.lock().servo_ids().to_vec()
    }

    pub fn set_torque(&self, enabled: bool) -> Result<()> {
        self.lock().set_torque(enabled)
    }

    pub fn get_torque(&self) -> bool {
        self.lock().get_torque()
    }

    pub fn get_positions(&self) -> Result<BTreeMap<ServoId, RawPosition>> {
        self.lock().get_positions()
    }

    pub fn get_angles(&self) -> Result<BTreeMap<ServoId, f64>> {
        self.lock().get_angles()
    }

    pub fn set_angle(&self, angles: &BTreeMap<ServoId, f64>) -> Result<()> {
        self.lock().set_angle(angles)
    }

    pub fn set_positions(&self, positions: &BTreeMap<ServoId, RawPosition>) -> Result<()> {
        self.lock().set_positions(positions)
    }

    pub fn center(&self) -> Result<()> {
        self.lock().center()
    }

    pub fn poll_angles(&self) -> Result<Option<BTreeMap<ServoId, f64>>> {
        self.lock().poll_angles()
    }

    pub fn calibration(&self) -> Option<CalibrationSet> {
        self.lock().calibration().cloned()
    }

    pub fn draft_calibration(&self) -> Option<DraftCalibration> {
        self.lock().draft_calibration().cloned()
    }

    pub fn start_calibration(&self) -> Result<()> {
        self.lock().start_calibration()
    }

    pub fn set_calibration_point(
        &self,
        id: ServoId,
        point: PointName,
        position: Option<RawPosition>,
    ) -> Result<RawPosition> {
        self.lock().set_calibration_point(id, point, position)
    }

    pub fn end_calibration(&self) -> Result<CalibrationSet> {
        self.lock().end_calibration()
    }

    pub fn cancel_calibration(&self) -> Result<()> {
        self.lock().cancel_calibration()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalibrationPoint, MemoryStore};
    use crate::group::RetryPolicy;
    use crate::sim::{SimHandle, SimulatedBus};
    use std::time::Duration;

    fn config(ids: &[ServoId]) -> BusConfig {
        let mut config = BusConfig::new("sim", ids.to_vec());
        config.retry = RetryPolicy {
            max_attempts: 3,
            backoff: Duration::ZERO,
        };
        config
    }

    fn calibrated(ids: &[ServoId]) -> CalibrationSet {
        CalibrationSet {
            timestamp: Utc::now(),
            servos: ids
                .iter()
                .map(|&id| (id, CalibrationPoint { zero: 2048, min: 1024, max: 3072 }))
                .collect(),
        }
    }

    fn bus(ids: &[ServoId], store: MemoryStore) -> (ServoBus<SimulatedBus>, SimHandle) {
        let sim = SimulatedBus::with_servos(ids);
        let handle = sim.handle();
        (ServoBus::new(config(ids), sim, store).unwrap(), handle)
    }

    #[test]
    fn connect_configures_every_servo() {
        let (mut bus, sim) = bus(&[1, 2], MemoryStore::default());
        bus.connect().unwrap();
        assert!(bus.is_connected());
        assert!(!bus.get_torque());
        for id in [1, 2] {
            assert_eq!(sim.register(id, Register::PCoefficient), 8);
            assert_eq!(sim.register(id, Register::DCoefficient), 16);
            assert_eq!(sim.register(id, Register::MaximumAcceleration), 254);
            assert_eq!(sim.register(id, Register::Acceleration), 254);
        }
        // Seven bring-up registers, one group write each.
        assert_eq!(sim.exchange_count(), 7);
        assert_eq!(sim.writes_to(Register::Mode), 1);
        assert_eq!(sim.writes_to(Register::TorqueEnable), 0);

        bus.connect().unwrap();
        assert_eq!(sim.open_count(), 1);
    }

    #[test]
    fn failed_bring_up_releases_the_port() {
        let (mut bus, sim) = bus(&[1], MemoryStore::default());
        sim.fail_always(true);
        let err = bus.connect().unwrap_err();
        assert!(matches!(err, ServoBusError::ConnectionFailed(_)));
        assert!(!sim.is_open());
        assert!(!bus.is_connected());

        sim.fail_always(false);
        bus.connect().unwrap();
        assert!(bus.is_connected());
    }

    #[test]
    fn open_failure_surfaces_as_connection_failure() {
        let (mut bus, sim) = bus(&[1], MemoryStore::default());
        sim.refuse_open(true);
        match bus.connect() {
            Err(ServoBusError::ConnectionFailed(inner)) => {
                assert!(matches!(*inner, ServoBusError::PortOpenFailed { .. }))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn operations_require_a_connection() {
        let (mut bus, sim) = bus(&[1], MemoryStore::new(Some(calibrated(&[1]))));
        assert!(matches!(bus.set_torque(true), Err(ServoBusError::NotConnected)));
        assert!(matches!(bus.get_positions(), Err(ServoBusError::NotConnected)));
        assert!(matches!(bus.get_angles(), Err(ServoBusError::NotConnected)));
        assert!(matches!(
            bus.set_angle(&BTreeMap::from([(1, 10.0)])),
            Err(ServoBusError::NotConnected)
        ));
        assert!(matches!(bus.start_calibration(), Err(ServoBusError::NotConnected)));
        assert_eq!(sim.exchange_count(), 0);
    }

    #[test]
    fn set_angle_with_torque_off_writes_nothing() {
        let (mut bus, sim) = bus(&[1, 2], MemoryStore::new(Some(calibrated(&[1, 2]))));
        bus.connect().unwrap();
        sim.reset_counters();
        let err = bus.set_angle(&BTreeMap::from([(1, 45.0)])).unwrap_err();
        assert!(matches!(err, ServoBusError::TorqueDisabled));
        assert_eq!(sim.exchange_count(), 0);
    }

    #[test]
    fn unknown_servo_rejects_whole_command() {
        let (mut bus, sim) = bus(&[1, 2], MemoryStore::new(Some(calibrated(&[1, 2]))));
        bus.connect().unwrap();
        bus.set_torque(true).unwrap();
        sim.reset_counters();
        let err = bus
            .set_angle(&BTreeMap::from([(1, 10.0), (9, 10.0)]))
            .unwrap_err();
        assert!(matches!(err, ServoBusError::UnknownServo(9)));
        assert_eq!(sim.write_count(), 0);
    }

    #[test]
    fn non_finite_angles_are_refused() {
        let (mut bus, sim) = bus(&[1], MemoryStore::new(Some(calibrated(&[1]))));
        bus.connect().unwrap();
        bus.set_torque(true).unwrap();
        sim.reset_counters();
        assert!(matches!(
            bus.set_angle(&BTreeMap::from([(1, f64::NAN)])),
            Err(ServoBusError::InvalidAngle { id: 1, .. })
        ));
        assert_eq!(sim.exchange_count(), 0);
    }

    #[test]
    fn angles_need_a_committed_calibration() {
        let (mut bus, _sim) = bus(&[1, 2], MemoryStore::new(Some(calibrated(&[1]))));
        bus.connect().unwrap();
        bus.set_torque(true).unwrap();
        assert!(matches!(
            bus.get_angles(),
            Err(ServoBusError::NotCalibrated(ids)) if ids == vec![2]
        ));
        bus.set_angle(&BTreeMap::from([(1, 45.0)])).unwrap();
        assert!(matches!(
            bus.set_angle(&BTreeMap::from([(2, 45.0)])),
            Err(ServoBusError::NotCalibrated(_))
        ));
    }

    #[test]
    fn set_angle_drives_calibrated_goal() {
        let (mut bus, sim) = bus(&[1, 2], MemoryStore::new(Some(calibrated(&[1, 2]))));
        bus.connect().unwrap();
        bus.set_torque(true).unwrap();
        bus.set_angle(&BTreeMap::from([(1, 45.0), (2, -45.0)])).unwrap();
        assert_eq!(sim.register(1, Register::GoalPosition), 2560);
        assert_eq!(sim.register(2, Register::GoalPosition), 1536);
        let angles = bus.get_angles().unwrap();
        assert_eq!(angles, BTreeMap::from([(1, 45.0), (2, -45.0)]));
    }

    #[test]
    fn goals_beyond_the_encoder_are_clamped() {
        let (mut bus, sim) = bus(&[1], MemoryStore::new(Some(calibrated(&[1]))));
        bus.connect().unwrap();
        bus.set_torque(true).unwrap();
        bus.set_angle(&BTreeMap::from([(1, 200.0)])).unwrap();
        assert_eq!(sim.register(1, Register::GoalPosition), 4095);
        bus.set_positions(&BTreeMap::from([(1, -20)])).unwrap();
        assert_eq!(sim.register(1, Register::GoalPosition), 0);
    }

    #[test]
    fn disconnect_releases_torque_first() {
        let (mut bus, sim) = bus(&[1, 2], MemoryStore::default());
        bus.connect().unwrap();
        bus.set_torque(true).unwrap();
        assert_eq!(sim.register(1, Register::TorqueEnable), 1);
        bus.disconnect().unwrap();
        assert_eq!(sim.register(1, Register::TorqueEnable), 0);
        assert_eq!(sim.register(2, Register::TorqueEnable), 0);
        assert!(!sim.is_open());
        bus.disconnect().unwrap();
    }

    #[test]
    fn disconnect_closes_even_when_torque_release_fails() {
        let (mut bus, sim) = bus(&[1], MemoryStore::default());
        bus.connect().unwrap();
        bus.set_torque(true).unwrap();
        sim.fail_always(true);
        assert!(matches!(bus.disconnect(), Err(ServoBusError::Communication { .. })));
        assert!(!sim.is_open());
        assert!(!bus.is_connected());

        sim.fail_always(false);
        bus.connect().unwrap();
    }

    #[test]
    fn dropping_the_engine_releases_torque() {
        let (mut bus, sim) = bus(&[1], MemoryStore::default());
        bus.connect().unwrap();
        bus.set_torque(true).unwrap();
        drop(bus);
        assert_eq!(sim.register(1, Register::TorqueEnable), 0);
        assert!(!sim.is_open());
    }

    #[test]
    fn poll_is_paused_during_calibration() {
        let (mut bus, sim) = bus(&[1], MemoryStore::new(Some(calibrated(&[1]))));
        assert_eq!(bus.poll_angles().unwrap(), None);
        bus.connect().unwrap();
        assert!(bus.poll_angles().unwrap().is_some());
        bus.start_calibration().unwrap();
        sim.reset_counters();
        assert_eq!(bus.poll_angles().unwrap(), None);
        assert_eq!(sim.exchange_count(), 0);
    }

    #[test]
    fn calibration_point_reads_live_position() {
        let (mut bus, sim) = bus(&[1], MemoryStore::default());
        bus.connect().unwrap();
        bus.start_calibration().unwrap();
        sim.set_present_position(1, 1999);
        assert_eq!(bus.set_calibration_point(1, PointName::Zero, None).unwrap(), 1999);
        assert_eq!(bus.set_calibration_point(1, PointName::Max, Some(3000)).unwrap(), 3000);
        let draft = bus.draft_calibration().unwrap();
        assert_eq!(draft.servos[&1].zero, Some(1999));
        assert_eq!(draft.servos[&1].max, Some(3000));
        assert!(matches!(
            bus.set_calibration_point(5, PointName::Min, Some(1)),
            Err(ServoBusError::UnknownServo(5))
        ));
    }

    #[test]
    fn calibration_point_outside_session_is_refused() {
        let (mut bus, _sim) = bus(&[1], MemoryStore::default());
        bus.connect().unwrap();
        assert!(matches!(
            bus.set_calibration_point(1, PointName::Zero, Some(1)),
            Err(ServoBusError::CalibrationNotStarted)
        ));
        assert!(matches!(bus.end_calibration(), Err(ServoBusError::CalibrationNotStarted)));
        assert!(matches!(bus.cancel_calibration(), Err(ServoBusError::CalibrationNotStarted)));
    }

    #[test]
    fn start_calibration_twice_keeps_the_draft() {
        let (mut bus, _sim) = bus(&[1], MemoryStore::default());
        bus.connect().unwrap();
        bus.start_calibration().unwrap();
        bus.set_calibration_point(1, PointName::Zero, Some(2000)).unwrap();
        bus.start_calibration().unwrap();
        assert_eq!(bus.draft_calibration().unwrap().servos[&1].zero, Some(2000));
    }

    #[test]
    fn torque_cannot_be_enabled_mid_calibration() {
        let (mut bus, sim) = bus(&[1], MemoryStore::default());
        bus.connect().unwrap();
        bus.set_torque(true).unwrap();
        bus.start_calibration().unwrap();
        assert_eq!(sim.register(1, Register::TorqueEnable), 0);
        assert!(!bus.get_torque());
        assert!(matches!(bus.set_torque(true), Err(ServoBusError::CalibrationInProgress)));
    }

    #[test]
    fn failed_save_keeps_session_open() {
        let store = MemoryStore::new(Some(calibrated(&[1])));
        let before = store.saved();
        let (mut bus, _sim) = bus(&[1], store.clone());
        bus.connect().unwrap();
        bus.start_calibration().unwrap();
        for (p, v) in [(PointName::Zero, 2000), (PointName::Min, 1000), (PointName::Max, 3000)] {
            bus.set_calibration_point(1, p, Some(v)).unwrap();
        }
        store.fail_saves(true);
        assert!(matches!(bus.end_calibration(), Err(ServoBusError::Store(_))));
        assert!(bus.is_calibrating());
        assert_eq!(bus.calibration().cloned(), before);

        store.fail_saves(false);
        let set = bus.end_calibration().unwrap();
        assert_eq!(set.servos[&1], CalibrationPoint { zero: 2000, min: 1000, max: 3000 });
        assert!(bus.get_torque());
    }

    #[test]
    fn explicit_points_must_fit_the_position_register() {
        let (mut bus, _sim) = bus(&[1], MemoryStore::default());
        bus.connect().unwrap();
        bus.start_calibration().unwrap();
        bus.set_calibration_point(1, PointName::Zero, Some(2048)).unwrap();
        for bad in [i32::MIN, -1, MAX_POSITION + 1, i32::MAX] {
            assert!(matches!(
                bus.set_calibration_point(1, PointName::Min, Some(bad)),
                Err(ServoBusError::InvalidPosition { id: 1, position }) if position == bad
            ));
        }
        assert_eq!(bus.draft_calibration().unwrap().servos[&1].min, None);

        // Extremes of the register are accepted, close to zero only warns.
        assert_eq!(bus.set_calibration_point(1, PointName::Min, Some(0)).unwrap(), 0);
        assert_eq!(
            bus.set_calibration_point(1, PointName::Max, Some(MAX_POSITION)).unwrap(),
            MAX_POSITION
        );
        assert_eq!(bus.set_calibration_point(1, PointName::Max, Some(2050)).unwrap(), 2050);
    }

    #[test]
    fn committed_calibration_is_returned_when_torque_fails() {
        let store = MemoryStore::default();
        let (mut bus, sim) = bus(&[1], store.clone());
        bus.connect().unwrap();
        bus.start_calibration().unwrap();
        for (p, v) in [(PointName::Zero, 2000), (PointName::Min, 1000), (PointName::Max, 3000)] {
            bus.set_calibration_point(1, p, Some(v)).unwrap();
        }
        sim.fail_always(true);
        let set = bus.end_calibration().unwrap();
        assert_eq!(store.saved(), Some(set.clone()));
        assert_eq!(bus.calibration(), Some(&set));
        assert!(!bus.is_calibrating());
        assert!(!bus.get_torque());
    }

    #[test]
    fn lost_link_recovers_through_disconnect() {
        let (mut bus, sim) = bus(&[1], MemoryStore::default());
        bus.connect().unwrap();
        sim.fail_always(true);
        assert!(matches!(bus.get_positions(), Err(ServoBusError::Communication { .. })));

        // Still considered connected, so connect alone does not reopen.
        sim.fail_always(false);
        bus.connect().unwrap();
        assert_eq!(sim.open_count(), 1);

        bus.disconnect().unwrap();
        bus.connect().unwrap();
        assert_eq!(sim.open_count(), 2);
        assert_eq!(bus.get_positions().unwrap()[&1], 2048);
    }
}
