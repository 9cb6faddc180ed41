//! Register Image (C4): the in-process Holding/Input register store backing
//! the Modbus TCP server, plus change notifications for HR[0], HR[8] and
//! HR[10..15].

use crate::device::DeviceSnapshot;
use crate::error::ProtocolError;
use std::sync::Mutex;
use tokio::sync::watch;

pub const HR_TARGET: u16 = 0;
pub const HR_MODE: u16 = 8;
pub const HR_CMD_BASE: u16 = 10;
pub const HR_CMD_COUNT: usize = 6;
const HR_SIZE: usize = 16;
const IR_SIZE: usize = 12;

/// Fired whenever HR[0], HR[8] or HR[10..15] changes, carrying the whole
/// holding-register array so subscribers can read whichever slots they
/// care about.
#[derive(Debug, Clone)]
pub struct HrChange {
    pub registers: [u16; HR_SIZE],
}

struct Inner {
    hr: [u16; HR_SIZE],
    ir: [u16; IR_SIZE],
}

pub struct RegisterImage {
    inner: Mutex<Inner>,
    hr_tx: watch::Sender<HrChange>,
}

impl RegisterImage {
    pub fn new() -> Self {
        let hr = [0u16; HR_SIZE];
        let (hr_tx, _rx) = watch::channel(HrChange { registers: hr });
        RegisterImage { inner: Mutex::new(Inner { hr, ir: [0u16; IR_SIZE] }), hr_tx }
    }

    pub fn subscribe_hr(&self) -> watch::Receiver<HrChange> {
        self.hr_tx.subscribe()
    }

    pub fn read_holding(&self, addr: u16, count: u16) -> Result<Vec<u16>, ProtocolError> {
        let inner = self.inner.lock().unwrap();
        read_range(&inner.hr, addr, count)
    }

    pub fn read_input(&self, addr: u16, count: u16) -> Result<Vec<u16>, ProtocolError> {
        let inner = self.inner.lock().unwrap();
        read_range(&inner.ir, addr, count)
    }

    pub fn write_single(&self, addr: u16, value: u16) -> Result<(), ProtocolError> {
        self.write_multiple(addr, &[value])
    }

    pub fn write_multiple(&self, addr: u16, values: &[u16]) -> Result<(), ProtocolError> {
        let changed = {
            let mut inner = self.inner.lock().unwrap();
            write_range(&mut inner.hr, addr, values)?;
            inner.hr
        };
        self.hr_tx.send_replace(HrChange { registers: changed });
        Ok(())
    }

    /// Zeroes HR[10] (the CMD_CODE slot) after the Command Router has
    /// consumed a MANUAL packet.
    pub fn clear_cmd_slot(&self) {
        let changed = {
            let mut inner = self.inner.lock().unwrap();
            inner.hr[HR_CMD_BASE as usize] = 0;
            inner.hr
        };
        self.hr_tx.send_replace(HrChange { registers: changed });
    }

    /// Publishes a Device Snapshot into the Input Register mirror.
    pub fn publish_snapshot(&self, snap: &DeviceSnapshot, auto_state_code: u16, mode: u16) {
        let mut inner = self.inner.lock().unwrap();
        let (pos_hi, pos_lo) = crate::rtu::s32_to_regs(snap.position);
        inner.ir[0] = pos_hi;
        inner.ir[1] = pos_lo;
        inner.ir[2] = snap.speed;
        inner.ir[3] = snap.temperature_tenths_c as u16;
        inner.ir[4] = snap.humidity_tenths_pct;
        inner.ir[5] = snap.ir_status_word();
        inner.ir[6] = snap.counter_value;
        inner.ir[7] = snap.counter_target;
        inner.ir[8] = auto_state_code;
        inner.ir[9] = mode;
        inner.ir[10] = if snap.step_enabled { 1 } else { 0 };
        inner.ir[11] = snap.jog_state.code();
    }

    pub fn mode(&self) -> u16 {
        self.inner.lock().unwrap().hr[HR_MODE as usize]
    }

    pub fn target(&self) -> u16 {
        self.inner.lock().unwrap().hr[HR_TARGET as usize]
    }

    pub fn cmd_packet(&self) -> [u16; HR_CMD_COUNT] {
        let inner = self.inner.lock().unwrap();
        let mut out = [0u16; HR_CMD_COUNT];
        out.copy_from_slice(&inner.hr[HR_CMD_BASE as usize..HR_CMD_BASE as usize + HR_CMD_COUNT]);
        out
    }
}

impl Default for RegisterImage {
    fn default() -> Self {
        Self::new()
    }
}

fn read_range(bank: &[u16], addr: u16, count: u16) -> Result<Vec<u16>, ProtocolError> {
    let start = addr as usize;
    let end = start + count as usize;
    if count == 0 || end > bank.len() {
        return Err(ProtocolError::IllegalAddress);
    }
    Ok(bank[start..end].to_vec())
}

fn write_range(bank: &mut [u16], addr: u16, values: &[u16]) -> Result<(), ProtocolError> {
    let start = addr as usize;
    let end = start + values.len();
    if values.is_empty() || end > bank.len() {
        return Err(ProtocolError::IllegalAddress);
    }
    bank[start..end].copy_from_slice(values);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_write_is_illegal_address() {
        let img = RegisterImage::new();
        assert!(matches!(img.write_single(200, 1), Err(ProtocolError::IllegalAddress)));
    }

    #[test]
    fn write_then_read_round_trips() {
        let img = RegisterImage::new();
        img.write_single(HR_TARGET, 42).unwrap();
        assert_eq!(img.read_holding(HR_TARGET, 1).unwrap(), vec![42]);
        assert_eq!(img.target(), 42);
    }

    #[test]
    fn manual_packet_write_and_clear() {
        let img = RegisterImage::new();
        img.write_multiple(HR_CMD_BASE, &[3, 0, 0x4E20, 0x1F40, 2, 2]).unwrap();
        assert_eq!(img.cmd_packet(), [3, 0, 0x4E20, 0x1F40, 2, 2]);
        img.clear_cmd_slot();
        assert_eq!(img.cmd_packet()[0], 0);
    }

    #[test]
    fn publish_snapshot_uses_ir_bit_layout_not_wire_layout() {
        let img = RegisterImage::new();
        let mut snap = DeviceSnapshot::default();
        snap.alarm = false;
        snap.in_position = true;
        snap.running = true;
        img.publish_snapshot(&snap, 2, 0);
        // bit1 (in_position) + bit2 (running) = 0b110, matching S6.
        assert_eq!(img.read_input(5, 1).unwrap(), vec![0b110]);
    }
}
