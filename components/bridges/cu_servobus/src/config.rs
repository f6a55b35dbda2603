//! Static bus configuration, loaded once at startup.
//!
//! ```json
//! {
//!   "port": "/dev/ttyACM0",
//!   "servo_ids": [1, 2, 3, 4],
//!   "gains": { "p": 8, "i": 0, "d": 16 },
//!   "retry": { "max_attempts": 10, "backoff_ms": 10 }
//! }
//! ```

use crate::error::{Result, ServoBusError};
use crate::group::RetryPolicy;
use crate::protocol::MAX_ID;
use crate::transport::{SerialSettings, DEFAULT_BAUD_RATE};
use crate::ServoId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Register values written to every servo when the bus comes up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoGains {
    /// 0 = position control.
    pub mode: u8,
    pub p: u8,
    pub i: u8,
    pub d: u8,
    pub max_acceleration: u16,
    pub acceleration: u8,
}

impl Default for ServoGains {
    fn default() -> Self {
        Self {
            mode: 0,
            p: 8,
            i: 0,
            d: 16,
            max_acceleration: 254,
            acceleration: 254,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub servo_ids: Vec<ServoId>,
    #[serde(default)]
    pub gains: ServoGains,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_calibration_file")]
    pub calibration_file: PathBuf,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_calibration_file() -> PathBuf {
    PathBuf::from("data/calibration.json")
}

impl BusConfig {
    pub fn new(port: impl Into<String>, servo_ids: Vec<ServoId>) -> Self {
        Self {
            port: port.into(),
            baud_rate: default_baud_rate(),
            timeout_ms: default_timeout_ms(),
            servo_ids,
            gains: ServoGains::default(),
            retry: RetryPolicy::default(),
            calibration_file: default_calibration_file(),
        }
    }

    /// Read and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ServoBusError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| ServoBusError::Config(format!("bad config JSON in {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port.is_empty() {
            return Err(ServoBusError::Config("no serial port configured".into()));
        }
        if self.servo_ids.is_empty() {
            return Err(ServoBusError::Config("no servo ids configured".into()));
        }
        let mut seen = BTreeSet::new();
        for &id in &self.servo_ids {
            if id == 0 || id > MAX_ID {
                return Err(ServoBusError::Config(format!(
                    "servo id {id} is outside 1..={MAX_ID}"
                )));
            }
            if !seen.insert(id) {
                return Err(ServoBusError::Config(format!("servo id {id} listed twice")));
            }
        }
        if self.baud_rate == 0 {
            return Err(ServoBusError::Config("baud rate must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ServoBusError::Config("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings {
            path: self.port.clone(),
            baud_rate: self.baud_rate,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}
