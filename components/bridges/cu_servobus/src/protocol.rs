//! Feetech SCS/STS packet framing (protocol 0).
//!
//! Instruction packet: `[0xFF, 0xFF, ID, LEN, INST, PARAMS.., CHK]`
//! Status packet:      `[0xFF, 0xFF, ID, LEN, ERR, DATA.., CHK]`
//!
//! `LEN` counts everything after itself, `CHK` is the inverted byte sum of
//! everything between the header and the checksum.

use crate::codec;
use crate::error::{Result, ServoBusError};
use crate::registers::RegisterDescriptor;
use crate::ServoId;

pub const HEADER: [u8; 2] = [0xFF, 0xFF];
pub const BROADCAST_ID: u8 = 0xFE;
/// Highest id a servo can be assigned.
pub const MAX_ID: u8 = 0xFC;
/// Longest packet the servo firmware accepts.
pub const MAX_PACKET_LEN: usize = 250;

/// Header, id, length, error/instruction and checksum.
const FRAME_OVERHEAD: usize = 6;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
    SyncRead = 0x82,
    SyncWrite = 0x83,
}

impl Instruction {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Ping),
            0x02 => Some(Self::Read),
            0x03 => Some(Self::Write),
            0x82 => Some(Self::SyncRead),
            0x83 => Some(Self::SyncWrite),
            _ => None,
        }
    }
}

pub fn checksum(data: &[u8]) -> u8 {
    let mut s: u8 = 0;
    for &b in data {
        s = s.wrapping_add(b);
    }
    !s
}

pub fn build_packet(id: u8, instruction: Instruction, params: &[u8]) -> Result<Vec<u8>> {
    if params.len() + FRAME_OVERHEAD > MAX_PACKET_LEN {
        return Err(ServoBusError::InvalidFrame(format!(
            "packet with {} parameter bytes exceeds {MAX_PACKET_LEN} bytes",
            params.len()
        )));
    }
    let length = (params.len() + 2) as u8;
    let mut pkt = Vec::with_capacity(FRAME_OVERHEAD + params.len());
    pkt.extend_from_slice(&HEADER);
    pkt.push(id);
    pkt.push(length);
    pkt.push(instruction as u8);
    pkt.extend_from_slice(params);
    pkt.push(checksum(&pkt[2..]));
    Ok(pkt)
}

/// Build a status packet as a servo would send it.
pub fn build_status(id: u8, error: u8, data: &[u8]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(FRAME_OVERHEAD + data.len());
    pkt.extend_from_slice(&HEADER);
    pkt.push(id);
    pkt.push((data.len() + 2) as u8);
    pkt.push(error);
    pkt.extend_from_slice(data);
    pkt.push(checksum(&pkt[2..]));
    pkt
}

fn address_byte(register: &RegisterDescriptor) -> Result<u8> {
    u8::try_from(register.address).map_err(|_| {
        ServoBusError::UnknownRegister(format!("{register} is outside the 8-bit address space"))
    })
}

fn check_width(register: &RegisterDescriptor) -> Result<u8> {
    match register.width {
        1 | 2 | 4 => Ok(register.width as u8),
        other => Err(ServoBusError::UnsupportedWidth(other)),
    }
}

/// A parsed status packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status<'a> {
    pub id: u8,
    pub error: u8,
    pub data: &'a [u8],
}

/// Parse one status packet carrying `width` data bytes from the front of `bytes`.
pub fn parse_status(bytes: &[u8], expected_id: u8, width: usize) -> Result<Status<'_>> {
    let frame_len = FRAME_OVERHEAD + width;
    if bytes.len() < frame_len {
        return Err(ServoBusError::InvalidFrame(format!(
            "servo {expected_id}: short status packet ({} of {frame_len} bytes)",
            bytes.len()
        )));
    }
    let frame = &bytes[..frame_len];
    if frame[..2] != HEADER {
        return Err(ServoBusError::InvalidFrame(format!(
            "servo {expected_id}: bad header {:02X?}",
            &frame[..2]
        )));
    }
    if frame[2] != expected_id {
        return Err(ServoBusError::InvalidFrame(format!(
            "expected servo {expected_id}, got {}",
            frame[2]
        )));
    }
    if frame[3] as usize != width + 2 {
        return Err(ServoBusError::InvalidFrame(format!(
            "servo {expected_id}: length {} does not match width {width}",
            frame[3]
        )));
    }
    let expected = checksum(&frame[2..frame_len - 1]);
    if frame[frame_len - 1] != expected {
        return Err(ServoBusError::InvalidFrame(format!(
            "servo {expected_id}: checksum {:02X} != {expected:02X}",
            frame[frame_len - 1]
        )));
    }
    Ok(Status {
        id: frame[2],
        error: frame[4],
        data: &frame[5..frame_len - 1],
    })
}

/// Prebuilt sync read request for one register over a fixed id list.
#[derive(Debug, Clone)]
pub struct SyncReadRequest {
    register: RegisterDescriptor,
    ids: Vec<ServoId>,
    packet: Vec<u8>,
}

impl SyncReadRequest {
    pub fn new(register: RegisterDescriptor, ids: &[ServoId]) -> Result<Self> {
        let mut params = Vec::with_capacity(2 + ids.len());
        params.push(address_byte(&register)?);
        params.push(check_width(&register)?);
        params.extend_from_slice(ids);
        let packet = build_packet(BROADCAST_ID, Instruction::SyncRead, &params)?;
        Ok(Self {
            register,
            ids: ids.to_vec(),
            packet,
        })
    }

    pub fn packet(&self) -> &[u8] {
        &self.packet
    }

    /// Bytes expected back: one status packet per id.
    pub fn response_len(&self) -> usize {
        self.ids.len() * (FRAME_OVERHEAD + self.register.width)
    }

    /// Decode the concatenated status packets, in request order.
    pub fn parse_response(&self, bytes: &[u8]) -> Result<Vec<(ServoId, u32)>> {
        let frame_len = FRAME_OVERHEAD + self.register.width;
        let mut values = Vec::with_capacity(self.ids.len());
        for (i, &id) in self.ids.iter().enumerate() {
            let start = i * frame_len;
            let status = parse_status(bytes.get(start..).unwrap_or(&[]), id, self.register.width)?;
            if status.error != 0 {
                log::warn!(
                    "servo {id} reported error bits 0x{:02X} reading {}",
                    status.error,
                    self.register.name
                );
            }
            values.push((id, codec::decode(status.data)?));
        }
        Ok(values)
    }
}

/// Sync write frame whose per-servo values can be replaced in place.
#[derive(Debug, Clone)]
pub struct SyncWriteFrame {
    register: RegisterDescriptor,
    ids: Vec<ServoId>,
    packet: Vec<u8>,
}

impl SyncWriteFrame {
    const PARAMS_START: usize = 5;

    pub fn new(register: RegisterDescriptor, ids: &[ServoId]) -> Result<Self> {
        let width = check_width(&register)?;
        let mut params = Vec::with_capacity(2 + ids.len() * (1 + register.width));
        params.push(address_byte(&register)?);
        params.push(width);
        for &id in ids {
            params.push(id);
            params.extend(std::iter::repeat_n(0u8, register.width));
        }
        let packet = build_packet(BROADCAST_ID, Instruction::SyncWrite, &params)?;
        Ok(Self {
            register,
            ids: ids.to_vec(),
            packet,
        })
    }

    /// Replace the value sent to the servo at `index` in the id list.
    pub fn set_value(&mut self, index: usize, value: u32) -> Result<()> {
        if index >= self.ids.len() {
            return Err(ServoBusError::InvalidFrame(format!(
                "sync write slot {index} out of range for {} servos",
                self.ids.len()
            )));
        }
        let width = self.register.width;
        let offset = Self::PARAMS_START + 2 + index * (1 + width) + 1;
        let bytes = codec::encode(value, width)?;
        self.packet[offset..offset + width].copy_from_slice(&bytes);
        let last = self.packet.len() - 1;
        self.packet[last] = checksum(&self.packet[2..last]);
        Ok(())
    }

    pub fn packet(&self) -> &[u8] {
        &self.packet
    }
}

/// A decoded instruction packet, as seen by a servo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionPacket {
    pub id: u8,
    pub instruction: Instruction,
    pub params: Vec<u8>,
}

/// Parse one instruction packet from the front of `bytes`.
///
/// Returns the packet and the number of bytes it occupied.
pub fn parse_instruction(bytes: &[u8]) -> Result<(InstructionPacket, usize)> {
    if bytes.len() < FRAME_OVERHEAD || bytes[..2] != HEADER {
        return Err(ServoBusError::InvalidFrame("missing instruction header".into()));
    }
    let length = bytes[3] as usize;
    let total = 4 + length;
    if length < 2 || bytes.len() < total {
        return Err(ServoBusError::InvalidFrame(format!(
            "truncated instruction packet ({} of {total} bytes)",
            bytes.len()
        )));
    }
    if bytes[total - 1] != checksum(&bytes[2..total - 1]) {
        return Err(ServoBusError::InvalidFrame("instruction checksum mismatch".into()));
    }
    let instruction = Instruction::from_byte(bytes[4]).ok_or_else(|| {
        ServoBusError::InvalidFrame(format!("unknown instruction 0x{:02X}", bytes[4]))
    })?;
    Ok((
        InstructionPacket {
            id: bytes[2],
            instruction,
            params: bytes[5..total - 1].to_vec(),
        },
        total,
    ))
}
