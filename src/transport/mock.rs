//! Simulated bq76pl536 chain for testing without hardware.
//!
//! `SimulatedChain` implements [`BusTransport`] with register-level fidelity:
//! - daisy-chain reachability (a chip only hears the bus when every chip below
//!   it already holds an address, which is what makes the reset "addressable
//!   plus one")
//! - discovery addressing through the 0x00 discovery address
//! - CRC-8 on every response, and CRC checking of every write
//! - ADC conversion with a configurable number of status polls before DRDY
//! - latched fault/alert registers with the write-back-then-zero clear sequence
//! - the SHDW_CTRL gate in front of the EPROM-backed registers
//!
//! It also provides failure injection and a transfer log for test verification.
//! The handle is cheap to clone; clones share the same chain.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use super::{BusTransport, Direction, Segment};
use crate::protocol::crc::Checksum;
use crate::protocol::registers::{addr, cmd, reg, DeviceStatus};

const REGISTER_SPACE: usize = 0x50;

/// Raw thermistor reading that decodes to 25 °C.
const ROOM_TEMPERATURE_RAW: u16 = 2048 + 25 * 120;

/// One register operation as seen on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusRecord {
    /// Write segment.
    Write {
        /// Target chip address.
        address: u8,
        /// Register written.
        register: u8,
        /// Value written.
        data: u8,
    },
    /// Read segment.
    Read {
        /// Target chip address.
        address: u8,
        /// First register read.
        register: u8,
        /// Bytes requested.
        count: u8,
    },
}

/// A single simulated monitor chip.
#[derive(Debug, Clone)]
pub struct SimulatedChip {
    regs: [u8; REGISTER_SPACE],
    address: u8,
    polls_until_ready: Option<u32>,
    shadow_unlocked: bool,
    pending_fault_clear: u8,
    pending_alert_clear: u8,
}

impl SimulatedChip {
    /// Unaddressed chip with no cells connected and both thermistors at 25 °C.
    pub fn new() -> Self {
        let mut chip = Self {
            regs: [0; REGISTER_SPACE],
            address: 0,
            polls_until_ready: None,
            shadow_unlocked: false,
            pending_fault_clear: 0,
            pending_alert_clear: 0,
        };
        chip.set_word(reg::TEMPERATURE1, ROOM_TEMPERATURE_RAW);
        chip.set_word(reg::TEMPERATURE2, ROOM_TEMPERATURE_RAW);
        chip
    }

    /// Chip with the given cell voltages on channels 1.. (millivolts).
    pub fn with_cells_mv(millivolts: &[u16]) -> Self {
        let mut raw = [0u16; 6];
        for (slot, mv) in raw.iter_mut().zip(millivolts) {
            *slot = ((*mv as u32 * 16383) / 6250) as u16;
        }
        Self::new().with_raw_cells(raw)
    }

    /// Set all six raw channel readings.
    pub fn with_raw_cells(mut self, raw: [u16; 6]) -> Self {
        for (register, value) in reg::VCELLS.iter().zip(raw) {
            self.set_word(*register, value);
        }
        self
    }

    /// Set both raw thermistor readings.
    pub fn with_raw_temperatures(mut self, ts1: u16, ts2: u16) -> Self {
        self.set_word(reg::TEMPERATURE1, ts1);
        self.set_word(reg::TEMPERATURE2, ts2);
        self
    }

    /// Latch FAULT_STATUS bits.
    pub fn with_fault(mut self, bits: u8) -> Self {
        self.regs[reg::FAULT_STATUS as usize] = bits;
        self
    }

    /// Latch ALERT_STATUS bits.
    pub fn with_alert(mut self, bits: u8) -> Self {
        self.regs[reg::ALERT_STATUS as usize] = bits;
        self
    }

    /// Set per-cell over/under-voltage fault registers.
    pub fn with_cell_faults(mut self, overvoltage: u8, undervoltage: u8) -> Self {
        self.regs[reg::COV_FAULT as usize] = overvoltage;
        self.regs[reg::CUV_FAULT as usize] = undervoltage;
        self
    }

    /// Chip left holding an address from a previous session.
    pub fn with_stale_address(mut self, address: u8) -> Self {
        self.assign_address(address);
        self
    }

    /// Current bus address (0 when unaddressed).
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Raw register byte.
    pub fn register(&self, register: u8) -> u8 {
        self.regs.get(register as usize).copied().unwrap_or(0)
    }

    fn set_word(&mut self, register: u8, value: u16) {
        let [hi, lo] = value.to_be_bytes();
        self.regs[register as usize] = hi;
        self.regs[register as usize + 1] = lo;
    }

    fn assign_address(&mut self, address: u8) {
        self.address = address & 0x3F;
        self.regs[reg::ADDRESS_CONTROL as usize] = self.address | cmd::ADDR_RQST;
    }

    fn reset(&mut self) {
        self.address = 0;
        self.regs[reg::ADDRESS_CONTROL as usize] = 0;
        self.polls_until_ready = None;
        self.shadow_unlocked = false;
    }

    fn device_status(&self) -> u8 {
        let mut status = DeviceStatus::empty();
        if self.address != 0 {
            status |= DeviceStatus::ADDR_RQST;
        }
        if self.regs[reg::FAULT_STATUS as usize] != 0 {
            status |= DeviceStatus::FAULT;
        }
        if self.regs[reg::ALERT_STATUS as usize] != 0 {
            status |= DeviceStatus::ALERT;
        }
        if self.polls_until_ready == Some(0) {
            status |= DeviceStatus::DRDY;
        }
        status.bits()
    }

    fn write(&mut self, register: u8, data: u8, ready_after: Option<u32>) {
        match register {
            reg::RESET => {
                if data == cmd::RESET_COMMAND {
                    self.reset();
                }
            }
            reg::ADDRESS_CONTROL => self.assign_address(data),
            reg::ADC_CONVERT => {
                if data & cmd::ADC_CONV != 0 {
                    self.polls_until_ready = ready_after;
                }
            }
            reg::SHDW_CTRL => self.shadow_unlocked = data == cmd::SHADOW_ENABLE,
            reg::FAULT_STATUS => {
                Self::latch_clear(
                    &mut self.regs[reg::FAULT_STATUS as usize],
                    &mut self.pending_fault_clear,
                    data,
                );
            }
            reg::ALERT_STATUS => {
                Self::latch_clear(
                    &mut self.regs[reg::ALERT_STATUS as usize],
                    &mut self.pending_alert_clear,
                    data,
                );
            }
            0x40..=0x4F => {
                if self.shadow_unlocked {
                    self.regs[register as usize] = data;
                }
                self.shadow_unlocked = false;
            }
            r if (r as usize) < REGISTER_SPACE => self.regs[r as usize] = data,
            _ => {}
        }
    }

    // Latched bits clear on a write of the same bits followed by a write of zero.
    fn latch_clear(latched: &mut u8, pending: &mut u8, data: u8) {
        if data == 0 {
            *latched &= !*pending;
            *pending = 0;
        } else {
            *pending = data & *latched;
        }
    }

    fn read(&mut self, register: u8, count: usize) -> Vec<u8> {
        (0..count)
            .map(|i| {
                let r = register as usize + i;
                if r == reg::DEVICE_STATUS as usize {
                    let status = self.device_status();
                    if let Some(polls) = self.polls_until_ready.as_mut() {
                        *polls = polls.saturating_sub(1);
                    }
                    status
                } else {
                    self.regs.get(r).copied().unwrap_or(0)
                }
            })
            .collect()
    }
}

impl Default for SimulatedChip {
    fn default() -> Self {
        Self::new()
    }
}

struct ChainState {
    chips: Vec<SimulatedChip>,
    transfers: Vec<Vec<BusRecord>>,
    fail_next: bool,
    corrupt_next_read: bool,
    ready_after: Option<u32>,
    checksum: Checksum,
}

impl ChainState {
    /// Chips that can hear the bus: every addressed chip up to and including the
    /// first unaddressed one.
    fn reachable(&self) -> usize {
        self.chips
            .iter()
            .position(|chip| chip.address == 0)
            .map(|first_unaddressed| first_unaddressed + 1)
            .unwrap_or(self.chips.len())
    }

    fn write_targets(&self, address: u8) -> Vec<usize> {
        let reachable = self.reachable();
        match address {
            addr::BROADCAST => (0..reachable).collect(),
            addr::DISCOVERY => (0..reachable)
                .find(|&i| self.chips[i].address == 0)
                .into_iter()
                .collect(),
            n => (0..reachable)
                .filter(|&i| self.chips[i].address == n)
                .collect(),
        }
    }

    fn read_target(&self, address: u8) -> Option<usize> {
        if address == addr::BROADCAST {
            return None;
        }
        self.write_targets(address).into_iter().next()
    }
}

/// Shared handle to a simulated chain of chips.
#[derive(Clone)]
pub struct SimulatedChain {
    state: Arc<Mutex<ChainState>>,
}

impl SimulatedChain {
    /// Chain of the given chips, position 0 nearest the host.
    pub fn new(chips: Vec<SimulatedChip>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ChainState {
                chips,
                transfers: Vec::new(),
                fail_next: false,
                corrupt_next_read: false,
                ready_after: Some(0),
                checksum: Checksum::new(),
            })),
        }
    }

    /// Chain with `cells_per_chip[i]` healthy 3.7 V cells on chip `i`.
    pub fn nominal(cells_per_chip: &[u8]) -> Self {
        let chips = cells_per_chip
            .iter()
            .map(|&cells| SimulatedChip::with_cells_mv(&vec![3700; cells.min(6) as usize]))
            .collect();
        Self::new(chips)
    }

    /// Make the next transfer fail at the transport layer.
    pub fn trigger_failure(&self) {
        self.state.lock().fail_next = true;
    }

    /// Corrupt the checksum byte of the next read response.
    pub fn corrupt_next_read(&self) {
        self.state.lock().corrupt_next_read = true;
    }

    /// Status reads after a conversion start before DRDY is reported.
    pub fn set_conversion_polls(&self, polls: u32) {
        self.state.lock().ready_after = Some(polls);
    }

    /// Conversions never complete.
    pub fn never_ready(&self) {
        self.state.lock().ready_after = None;
    }

    /// Replace one raw channel reading on chip position `index`.
    pub fn set_raw_cell(&self, index: usize, channel: usize, raw: u16) {
        let mut state = self.state.lock();
        if let (Some(chip), Some(register)) = (state.chips.get_mut(index), reg::VCELLS.get(channel)) {
            chip.set_word(*register, raw);
        }
    }

    /// Latch FAULT_STATUS bits on chip position `index`.
    pub fn raise_fault(&self, index: usize, bits: u8) {
        if let Some(chip) = self.state.lock().chips.get_mut(index) {
            chip.regs[reg::FAULT_STATUS as usize] |= bits;
        }
    }

    /// Snapshot of chip position `index`.
    pub fn chip(&self, index: usize) -> Option<SimulatedChip> {
        self.state.lock().chips.get(index).cloned()
    }

    /// Every transfer so far, one entry per batch.
    pub fn transfers(&self) -> Vec<Vec<BusRecord>> {
        self.state.lock().transfers.clone()
    }
}

impl std::fmt::Debug for SimulatedChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimulatedChain")
            .field("chips", &state.chips.len())
            .field("transfers", &state.transfers.len())
            .finish()
    }
}

#[async_trait]
impl BusTransport for SimulatedChain {
    async fn transfer(&mut self, tx: &[u8], rx: &mut [u8], segments: &[Segment]) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if std::mem::take(&mut state.fail_next) {
            bail!("simulated bus failure");
        }

        let mut record = Vec::with_capacity(segments.len());
        for segment in segments {
            let bytes = tx
                .get(segment.range())
                .ok_or_else(|| anyhow!("segment {:?} outside outbound buffer", segment))?;
            if bytes.len() < 4 {
                bail!("segment {:?} shorter than a register operation", segment);
            }
            let address = bytes[0] >> 1;
            let register = bytes[1];

            match segment.direction {
                Direction::Write => {
                    if bytes[0] & 1 == 0 || bytes.len() != 4 {
                        bail!("malformed write segment {:02x?}", bytes);
                    }
                    let data = bytes[2];
                    record.push(BusRecord::Write {
                        address,
                        register,
                        data,
                    });

                    let crc_ok = state.checksum.compute(&bytes[..3], 0) == bytes[3];
                    let ready_after = state.ready_after;
                    for i in state.write_targets(address) {
                        let chip = &mut state.chips[i];
                        if crc_ok {
                            chip.write(register, data, ready_after);
                        } else {
                            chip.regs[reg::FAULT_STATUS as usize] |= 0x04;
                        }
                    }
                }
                Direction::Read => {
                    let count = bytes[2];
                    if bytes[0] & 1 != 0 || bytes.len() != 4 + count as usize {
                        bail!("malformed read segment {:02x?}", bytes);
                    }
                    record.push(BusRecord::Read {
                        address,
                        register,
                        count,
                    });

                    let inbound = rx
                        .get_mut(segment.range())
                        .ok_or_else(|| anyhow!("segment {:?} outside inbound buffer", segment))?;
                    if let Some(i) = state.read_target(address) {
                        let data = state.chips[i].read(register, count as usize);
                        let mut crc = state.checksum.compute(&bytes[..3], 0);
                        crc = state.checksum.compute(&data, crc);
                        if std::mem::take(&mut state.corrupt_next_read) {
                            crc ^= 0xFF;
                        }
                        inbound[3..3 + data.len()].copy_from_slice(&data);
                        inbound[3 + data.len()] = crc;
                    }
                }
            }
        }

        state.transfers.push(record);
        Ok(())
    }
}
