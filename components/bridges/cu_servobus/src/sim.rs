//! In-memory servo bus.
//!
//! [`SimulatedBus`] implements [`BusTransport`] by decoding instruction
//! packets and answering from per-servo register memory, the way real
//! servos on the wire would. A [`SimHandle`] stays with the caller after
//! the bus is moved into an engine, to inspect traffic, move joints by
//! hand, or inject failures.

use crate::error::{Result, ServoBusError};
use crate::protocol::{build_status, parse_instruction, Instruction, InstructionPacket, BROADCAST_ID};
use crate::registers::Register;
use crate::transport::{BusTransport, SerialSettings};
use crate::ServoId;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

const CONTROL_TABLE_LEN: usize = 128;

#[derive(Debug, Default)]
struct SimState {
    servos: BTreeMap<ServoId, [u8; CONTROL_TABLE_LEN]>,
    open: bool,
    opens: usize,
    refuse_open: bool,
    fail_next: u32,
    fail_always: bool,
    exchanges: usize,
    requests: Vec<InstructionPacket>,
}

impl SimState {
    fn read(&self, id: ServoId, addr: usize, len: usize) -> Option<Vec<u8>> {
        let mem = self.servos.get(&id)?;
        mem.get(addr..addr + len).map(<[u8]>::to_vec)
    }

    fn write(&mut self, id: ServoId, addr: usize, data: &[u8]) {
        let Some(mem) = self.servos.get_mut(&id) else {
            return;
        };
        if let Some(slot) = mem.get_mut(addr..addr + data.len()) {
            slot.copy_from_slice(data);
        }
        // Servos under torque reach their goal instantly.
        let goal = Register::GoalPosition.descriptor().address as usize;
        let present = Register::PresentPosition.descriptor().address as usize;
        let torque = Register::TorqueEnable.descriptor().address as usize;
        if mem[torque] != 0 && (addr..addr + data.len()).contains(&goal) {
            let (g0, g1) = (mem[goal], mem[goal + 1]);
            mem[present] = g0;
            mem[present + 1] = g1;
        }
    }

    fn respond(&mut self, pkt: &InstructionPacket) -> Vec<u8> {
        let p = &pkt.params;
        match pkt.instruction {
            Instruction::SyncWrite if p.len() >= 2 => {
                let (addr, width) = (p[0] as usize, p[1] as usize);
                for chunk in p[2..].chunks_exact(width + 1) {
                    self.write(chunk[0], addr, &chunk[1..]);
                }
                Vec::new()
            }
            Instruction::SyncRead if p.len() >= 2 => {
                let (addr, width) = (p[0] as usize, p[1] as usize);
                p[2..]
                    .iter()
                    .filter_map(|&id| self.read(id, addr, width).map(|d| build_status(id, 0, &d)))
                    .flatten()
                    .collect()
            }
            Instruction::Read if p.len() >= 2 => self
                .read(pkt.id, p[0] as usize, p[1] as usize)
                .map(|d| build_status(pkt.id, 0, &d))
                .unwrap_or_default(),
            Instruction::Write if !p.is_empty() => {
                self.write(pkt.id, p[0] as usize, &p[1..]);
                if pkt.id == BROADCAST_ID || !self.servos.contains_key(&pkt.id) {
                    Vec::new()
                } else {
                    build_status(pkt.id, 0, &[])
                }
            }
            Instruction::Ping if self.servos.contains_key(&pkt.id) => build_status(pkt.id, 0, &[]),
            _ => Vec::new(),
        }
    }
}

/// Simulated bus with servos parked at mid travel.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBus {
    pub fn with_servos(ids: &[ServoId]) -> Self {
        let bus = Self::default();
        {
            let mut state = bus.state.lock();
            for &id in ids {
                state.servos.insert(id, [0u8; CONTROL_TABLE_LEN]);
            }
        }
        for &id in ids {
            bus.handle().set_present_position(id, 2048);
        }
        bus
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl BusTransport for SimulatedBus {
    fn open(&mut self, settings: &SerialSettings) -> Result<()> {
        let mut state = self.state.lock();
        if state.open {
            return Ok(());
        }
        if state.refuse_open {
            return Err(ServoBusError::PortOpenFailed {
                path: settings.path.clone(),
                reason: "simulated open failure".into(),
            });
        }
        state.open = true;
        state.opens += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().open = false;
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn exchange(&mut self, request: &[u8], response_len: usize) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(ServoBusError::PortClosed);
        }
        state.exchanges += 1;
        if state.fail_always {
            return Err(ServoBusError::CommFailure("simulated line noise".into()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(ServoBusError::CommFailure("simulated line noise".into()));
        }

        let (pkt, _) = parse_instruction(request)?;
        let mut response = state.respond(&pkt);
        state.requests.push(pkt);
        if response.len() < response_len {
            return Err(ServoBusError::CommFailure(format!(
                "timed out waiting for {response_len} response bytes, got {}",
                response.len()
            )));
        }
        response.truncate(response_len);
        Ok(response)
    }
}

/// Inspection and fault injection for a [`SimulatedBus`].
#[derive(Debug, Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    /// Move a servo as an operator would with torque off.
    pub fn set_present_position(&self, id: ServoId, position: u16) {
        let addr = Register::PresentPosition.descriptor().address as usize;
        if let Some(mem) = self.state.lock().servos.get_mut(&id) {
            mem[addr..addr + 2].copy_from_slice(&position.to_le_bytes());
        }
    }

    /// Current value of a register on one servo, 0 for unknown servos.
    pub fn register(&self, id: ServoId, register: Register) -> u32 {
        let d = register.descriptor();
        self.state
            .lock()
            .read(id, d.address as usize, d.width)
            .and_then(|bytes| crate::codec::decode(&bytes).ok())
            .unwrap_or(0)
    }

    pub fn exchange_count(&self) -> usize {
        self.state.lock().exchanges
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().opens
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Number of successfully decoded writes addressed to `register`.
    pub fn writes_to(&self, register: Register) -> usize {
        let addr = register.descriptor().address as u8;
        self.state
            .lock()
            .requests
            .iter()
            .filter(|p| matches!(p.instruction, Instruction::SyncWrite | Instruction::Write))
            .filter(|p| p.params.first() == Some(&addr))
            .count()
    }

    pub fn write_count(&self) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|p| matches!(p.instruction, Instruction::SyncWrite | Instruction::Write))
            .count()
    }

    pub fn fail_next(&self, n: u32) {
        self.state.lock().fail_next = n;
    }

    pub fn fail_always(&self, fail: bool) {
        self.state.lock().fail_always = fail;
    }

    pub fn refuse_open(&self, refuse: bool) {
        self.state.lock().refuse_open = refuse;
    }

    pub fn reset_counters(&self) {
        let mut state = self.state.lock();
        state.exchanges = 0;
        state.requests.clear();
    }
}
