//! Little-endian register value codec.
//!
//! Register values on the bus are unsigned integers of 1, 2 or 4 bytes,
//! least significant byte first.

use crate::error::{Result, ServoBusError};

/// Encode the low `width` bytes of `value`, little-endian.
pub fn encode(value: u32, width: usize) -> Result<Vec<u8>> {
    match width {
        1 | 2 | 4 => Ok(value.to_le_bytes()[..width].to_vec()),
        other => Err(ServoBusError::UnsupportedWidth(other)),
    }
}

/// Decode a 1, 2 or 4 byte little-endian slice.
pub fn decode(bytes: &[u8]) -> Result<u32> {
    match *bytes {
        [b0] => Ok(b0 as u32),
        [b0, b1] => Ok(u16::from_le_bytes([b0, b1]) as u32),
        [b0, b1, b2, b3] => Ok(u32::from_le_bytes([b0, b1, b2, b3])),
        _ => Err(ServoBusError::UnsupportedWidth(bytes.len())),
    }
}
