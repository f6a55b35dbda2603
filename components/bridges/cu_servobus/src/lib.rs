//! Control engine for Feetech STS/SCS serial bus servos.
//!
//! Layers, bottom up:
//! - [`codec`], [`registers`] and [`protocol`]: bytes, the control table and
//!   packet framing;
//! - [`transport`]: one request/response exchange on a serial port
//!   ([`sim`] provides an in-memory bus for tests and dry runs);
//! - [`group`]: sync read/write of one register across many servos, with
//!   bounded retry;
//! - [`state`], [`calibration`] and [`mapping`]: torque/calibration state
//!   machine, committed and draft calibration, and angle conversion;
//! - [`engine`]: the public operations, serialized behind one lock;
//! - [`poller`]: periodic angle publication.
//!
//! ```no_run
//! use cu_servobus::{BusConfig, Engine};
//! use std::collections::BTreeMap;
//!
//! let engine = Engine::open_serial(BusConfig::new("/dev/ttyACM0", vec![1, 2, 3]))?;
//! engine.connect()?;
//! engine.set_torque(true)?;
//! engine.set_angle(&BTreeMap::from([(1, 45.0), (2, -10.0)]))?;
//! # Ok::<(), cu_servobus::ServoBusError>(())
//! ```

pub mod calibration;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod group;
pub mod mapping;
pub mod poller;
pub mod protocol;
pub mod registers;
pub mod sim;
pub mod state;
pub mod transport;

/// Bus address of a servo, 1..=252.
pub type ServoId = u8;

pub use calibration::{
    CalibrationPoint, CalibrationSet, CalibrationStore, DraftCalibration, JsonFileStore,
    MemoryStore, PointName, RawPosition,
};
pub use config::{BusConfig, ServoGains};
pub use engine::{Engine, EngineStatus, ServoBus};
pub use error::{Result, ServoBusError};
pub use group::RetryPolicy;
pub use poller::{PollEvent, PollSettings, PositionPoller};
pub use registers::{Register, RegisterDescriptor, MAX_POSITION};
pub use state::{CalibrationMode, DeviceState};
pub use transport::{list_ports, BusTransport, SerialSettings, SerialTransport};
