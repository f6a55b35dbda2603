//! STS3215 control table entries used by the engine.
//!
//! Addresses and widths are dictated by the servo firmware and must match
//! bit for bit.

use crate::error::{Result, ServoBusError};
use std::fmt;

/// Name, address and byte width of one control table register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterDescriptor {
    pub name: &'static str,
    pub address: u16,
    pub width: usize,
}

impl fmt::Display for RegisterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.address)
    }
}

/// Logical registers known to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    PCoefficient,
    DCoefficient,
    ICoefficient,
    Mode,
    TorqueEnable,
    Acceleration,
    GoalPosition,
    Lock,
    PresentPosition,
    MaximumAcceleration,
}

impl Register {
    pub const ALL: [Register; 10] = [
        Register::PCoefficient,
        Register::DCoefficient,
        Register::ICoefficient,
        Register::Mode,
        Register::TorqueEnable,
        Register::Acceleration,
        Register::GoalPosition,
        Register::Lock,
        Register::PresentPosition,
        Register::MaximumAcceleration,
    ];

    pub const fn descriptor(self) -> RegisterDescriptor {
        let (name, address, width) = match self {
            Register::PCoefficient => ("P_Coefficient", 21, 1),
            Register::DCoefficient => ("D_Coefficient", 22, 1),
            Register::ICoefficient => ("I_Coefficient", 23, 1),
            Register::Mode => ("Mode", 33, 1),
            Register::TorqueEnable => ("Torque_Enable", 40, 1),
            Register::Acceleration => ("Acceleration", 41, 1),
            Register::GoalPosition => ("Goal_Position", 42, 2),
            Register::Lock => ("Lock", 55, 1),
            Register::PresentPosition => ("Present_Position", 56, 2),
            Register::MaximumAcceleration => ("Maximum_Acceleration", 85, 2),
        };
        RegisterDescriptor {
            name,
            address,
            width,
        }
    }
}

/// Look a register up by its control table name, e.g. `"Goal_Position"`.
pub fn lookup(name: &str) -> Result<RegisterDescriptor> {
    Register::ALL
        .iter()
        .map(|r| r.descriptor())
        .find(|d| d.name == name)
        .ok_or_else(|| ServoBusError::UnknownRegister(name.to_string()))
}

/// Highest raw value accepted by the position registers (12-bit encoder).
pub const MAX_POSITION: i32 = 4095;
