//! Connection, torque and calibration status of the bus.
//!
//! Invariants held by every transition:
//! - torque can only be on while connected;
//! - torque is off while a calibration is in progress.

use crate::error::{Result, ServoBusError};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationMode {
    #[default]
    Idle,
    InProgress,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceState {
    connected: bool,
    torque_enabled: bool,
    calibration: CalibrationMode,
}

impl DeviceState {
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn torque_enabled(&self) -> bool {
        self.torque_enabled
    }

    pub fn is_calibrating(&self) -> bool {
        self.calibration == CalibrationMode::InProgress
    }

    pub fn require_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(ServoBusError::NotConnected)
        }
    }

    pub fn require_calibrating(&self) -> Result<()> {
        self.require_connected()?;
        if self.is_calibrating() {
            Ok(())
        } else {
            Err(ServoBusError::CalibrationNotStarted)
        }
    }

    /// Check that torque may be switched to `enabled`.
    pub fn check_torque(&self, enabled: bool) -> Result<()> {
        self.require_connected()?;
        if enabled && self.is_calibrating() {
            return Err(ServoBusError::CalibrationInProgress);
        }
        Ok(())
    }

    /// Freshly opened and configured: connected, torque off, idle.
    pub fn connected() -> Self {
        Self {
            connected: true,
            torque_enabled: false,
            calibration: CalibrationMode::Idle,
        }
    }

    pub fn set_torque(&mut self, enabled: bool) -> Result<()> {
        self.check_torque(enabled)?;
        self.torque_enabled = enabled;
        Ok(())
    }

    pub fn begin_calibration(&mut self) -> Result<()> {
        self.require_connected()?;
        self.torque_enabled = false;
        self.calibration = CalibrationMode::InProgress;
        Ok(())
    }

    pub fn end_calibration(&mut self) {
        self.calibration = CalibrationMode::Idle;
    }
}
