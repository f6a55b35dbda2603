//! Error taxonomy for the servo bus engine.

use crate::calibration::PointName;
use crate::ServoId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServoBusError {
    #[error("failed to open serial port '{path}': {reason}")]
    PortOpenFailed { path: String, reason: String },

    #[error("serial port is not open")]
    PortClosed,

    /// A single request/response exchange failed. Retried by the group engine.
    #[error("bus exchange failed: {0}")]
    CommFailure(String),

    /// A status packet came back malformed (bad header, id, length or checksum).
    #[error("malformed status packet: {0}")]
    InvalidFrame(String),

    /// The retry budget of a group transaction was exhausted.
    #[error("communication error on {register} after {attempts} attempts: {last}")]
    Communication {
        register: &'static str,
        attempts: u32,
        last: String,
    },

    /// Opening or bringing up the bus failed; the port has been released.
    #[error("connection failed: {0}")]
    ConnectionFailed(#[source] Box<ServoBusError>),

    #[error("not connected")]
    NotConnected,

    #[error("no committed calibration for servos {0:?}")]
    NotCalibrated(Vec<ServoId>),

    #[error("torque is disabled")]
    TorqueDisabled,

    #[error("unknown servo id {0}")]
    UnknownServo(ServoId),

    #[error("invalid calibration point '{0}', expected zero, min or max")]
    InvalidPointName(String),

    #[error("position {position} for servo {id} is outside 0..={max}", max = crate::registers::MAX_POSITION)]
    InvalidPosition { id: ServoId, position: i32 },

    #[error("invalid angle {angle} for servo {id}")]
    InvalidAngle { id: ServoId, angle: f64 },

    #[error("calibration incomplete, missing {}", format_missing(.missing))]
    IncompleteCalibration { missing: Vec<(ServoId, PointName)> },

    #[error("no calibration in progress")]
    CalibrationNotStarted,

    #[error("operation not allowed while calibration is in progress")]
    CalibrationInProgress,

    #[error("unsupported register width {0}")]
    UnsupportedWidth(usize),

    #[error("unknown register '{0}'")]
    UnknownRegister(String),

    #[error("calibration store: {0}")]
    Store(String),

    #[error("bad configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn format_missing(missing: &[(ServoId, PointName)]) -> String {
    missing
        .iter()
        .map(|(id, point)| format!("{id}:{point}"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl ServoBusError {
    /// True for failures of a single exchange, which the group engine retries.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::CommFailure(_) | Self::InvalidFrame(_) | Self::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ServoBusError>;
