//! Device Driver (C3): typed RTU transactions against the three slaves on
//! the field bus, aggregated into a Device Snapshot.

use crate::config::RtuConfig;
use crate::rtu::{self, VerifiedFrame};
use crate::serial::Transact;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

const ADDR_STEP: u16 = 0x0000;
const ADDR_RESET_ALARM: u16 = 0x0001;
const ADDR_STOP: u16 = 0x0002;
const ADDR_MOVE_ABS: u16 = 0x0020;
const ADDR_JOG: u16 = 0x0030;

const ADDR_COUNTER_BASE: u16 = 0x0000;
const ADDR_COUNTER_TARGET: u16 = 0x0001;
const ADDR_COUNTER_RESET: u16 = 0x0003;

const ADDR_SENSOR: u16 = 0x0001;
const ADDR_POSITION: u16 = 0x1000;
const ADDR_STATUS: u16 = 0x1010;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JogState {
    Off,
    Cw,
    Ccw,
}

impl JogState {
    pub fn code(self) -> u16 {
        match self {
            JogState::Off => 0,
            JogState::Cw => 1,
            JogState::Ccw => 2,
        }
    }
}

/// An immutable, atomically-published view of field device state.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub position: i32,
    pub speed: u16,
    pub temperature_tenths_c: i16,
    pub humidity_tenths_pct: u16,
    pub alarm: bool,
    pub in_position: bool,
    pub running: bool,
    pub counter_value: u16,
    pub counter_target: u16,
    pub counter_done: bool,
    pub sensor_online: bool,
    pub driver_online: bool,
    pub step_enabled: bool,
    pub jog_state: JogState,
    pub timestamp: Instant,
}

impl Default for DeviceSnapshot {
    fn default() -> Self {
        DeviceSnapshot {
            position: 0,
            speed: 0,
            temperature_tenths_c: 0,
            humidity_tenths_pct: 0,
            alarm: false,
            in_position: false,
            running: false,
            counter_value: 0,
            counter_target: 0,
            counter_done: false,
            sensor_online: false,
            driver_online: false,
            step_enabled: false,
            jog_state: JogState::Off,
            timestamp: Instant::now(),
        }
    }
}

impl DeviceSnapshot {
    /// Re-encodes alarm/in_position/running as the published IR[5] bit
    /// layout: bit0=alarm, bit1=in_position, bit2=running. This is distinct
    /// from the raw RTU wire status word (bit8/bit4/bit2) read off 0x1010.
    pub fn ir_status_word(&self) -> u16 {
        let mut word = 0u16;
        if self.alarm {
            word |= 1 << 0;
        }
        if self.in_position {
            word |= 1 << 1;
        }
        if self.running {
            word |= 1 << 2;
        }
        word
    }
}

/// Decodes the raw RTU status register (bit8=alarm, bit4=in_position,
/// bit2=running), as read directly off FC03 @ 0x1010.
fn decode_wire_status(reg: u16) -> (bool, bool, bool) {
    (reg & (1 << 8) != 0, reg & (1 << 4) != 0, reg & (1 << 2) != 0)
}

pub struct DeviceDriver {
    transport: Arc<dyn Transact>,
    rtu: RtuConfig,
}

impl DeviceDriver {
    pub fn new(transport: Arc<dyn Transact>, rtu: RtuConfig) -> Self {
        DeviceDriver { transport, rtu }
    }

    async fn read_registers(&self, slave: u8, addr: u16, count: u16) -> Option<Vec<u16>> {
        let frame = rtu::build_read_holding(slave, addr, count);
        let response = match self.transport.transact(frame).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(slave, error = %e, "read failed");
                return None;
            }
        };
        match rtu::verify_frame(&response) {
            Ok(VerifiedFrame::Ok(parsed)) => Some(rtu::regs_from_read_payload(&parsed.payload)),
            Ok(VerifiedFrame::Exception { exception_code, .. }) => {
                warn!(slave, exception_code, "slave returned exception");
                None
            }
            Err(e) => {
                warn!(slave, error = %e, "frame verification failed");
                None
            }
        }
    }

    async fn read_input_registers(&self, slave: u8, addr: u16, count: u16) -> Option<Vec<u16>> {
        let frame = rtu::build_read_input(slave, addr, count);
        let response = match self.transport.transact(frame).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(slave, error = %e, "read failed");
                return None;
            }
        };
        match rtu::verify_frame(&response) {
            Ok(VerifiedFrame::Ok(parsed)) => Some(rtu::regs_from_read_payload(&parsed.payload)),
            Ok(VerifiedFrame::Exception { exception_code, .. }) => {
                warn!(slave, exception_code, "slave returned exception");
                None
            }
            Err(e) => {
                warn!(slave, error = %e, "frame verification failed");
                None
            }
        }
    }

    async fn write_single(&self, slave: u8, addr: u16, value: u16) -> bool {
        let frame = rtu::build_write_single(slave, addr, value);
        self.transact_write(slave, frame).await
    }

    async fn write_multiple(&self, slave: u8, addr: u16, values: &[u16]) -> bool {
        let frame = rtu::build_write_multiple(slave, addr, values);
        self.transact_write(slave, frame).await
    }

    async fn transact_write(&self, slave: u8, frame: Vec<u8>) -> bool {
        let response = match self.transport.transact(frame).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(slave, error = %e, "write failed");
                return false;
            }
        };
        match rtu::verify_frame(&response) {
            Ok(VerifiedFrame::Ok(_)) => true,
            Ok(VerifiedFrame::Exception { exception_code, .. }) => {
                warn!(slave, exception_code, "slave rejected write");
                false
            }
            Err(e) => {
                warn!(slave, error = %e, "frame verification failed");
                false
            }
        }
    }

    /// Polls sensor, driver position, driver status, counter — in that
    /// order — and folds the results into the previous snapshot so a
    /// single failing device doesn't blank out the others.
    pub async fn poll(&self, previous: &DeviceSnapshot) -> DeviceSnapshot {
        let mut snap = previous.clone();
        snap.timestamp = Instant::now();

        if let Some(regs) = self.read_input_registers(self.rtu.slave_sensor, ADDR_SENSOR, 2).await {
            if regs.len() >= 2 {
                snap.temperature_tenths_c = regs[0] as i16;
                snap.humidity_tenths_pct = regs[1];
                snap.sensor_online = true;
            }
        } else {
            snap.sensor_online = false;
        }

        let mut driver_ok = true;

        if let Some(regs) = self.read_registers(self.rtu.slave_driver, ADDR_POSITION, 2).await {
            if regs.len() >= 2 {
                snap.position = rtu::regs_to_s32(regs[0], regs[1]);
            }
        } else {
            driver_ok = false;
        }

        if let Some(regs) = self.read_registers(self.rtu.slave_driver, ADDR_STATUS, 1).await {
            if let Some(&word) = regs.first() {
                let (alarm, in_position, running) = decode_wire_status(word);
                snap.alarm = alarm;
                snap.in_position = in_position;
                snap.running = running;
            }
        } else {
            driver_ok = false;
        }

        snap.driver_online = driver_ok;

        if let Some(regs) = self.read_registers(self.rtu.slave_counter, ADDR_COUNTER_BASE, 4).await {
            if regs.len() >= 3 {
                snap.counter_value = regs[0];
                snap.counter_target = regs[1];
                snap.counter_done = regs[2] & 0x0001 != 0;
            }
        }

        snap
    }

    pub async fn motor_step(&self, on: bool) -> bool {
        self.write_single(self.rtu.slave_driver, ADDR_STEP, if on { 1 } else { 0 }).await
    }

    pub async fn motor_reset_alarm(&self) -> bool {
        self.write_single(self.rtu.slave_driver, ADDR_RESET_ALARM, 1).await
    }

    pub async fn motor_stop(&self) -> bool {
        self.write_single(self.rtu.slave_driver, ADDR_STOP, 1).await
    }

    pub async fn motor_move_abs(&self, pos: i32, speed: u32) -> bool {
        let (pos_hi, pos_lo) = rtu::s32_to_regs(pos);
        let (speed_hi, speed_lo) = rtu::s32_to_regs(speed as i32);
        self.write_multiple(self.rtu.slave_driver, ADDR_MOVE_ABS, &[pos_hi, pos_lo, speed_hi, speed_lo]).await
    }

    pub async fn motor_jog(&self, dir_cw: bool, speed: u32) -> bool {
        let (speed_hi, speed_lo) = rtu::s32_to_regs(speed as i32);
        let dir = if dir_cw { 1 } else { 0 };
        self.write_multiple(self.rtu.slave_driver, ADDR_JOG, &[speed_hi, speed_lo, 0, dir]).await
    }

    pub async fn counter_set_target(&self, n: u16) -> bool {
        info!(target = n, "forwarding counter target to device");
        self.write_single(self.rtu.slave_counter, ADDR_COUNTER_TARGET, n).await
    }

    pub async fn counter_reset(&self) -> bool {
        self.write_single(self.rtu.slave_counter, ADDR_COUNTER_RESET, 1).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::test_support::FakeTransport;
    use crate::rtu::crc;

    fn fc04_response(slave: u8, regs: &[u16]) -> Vec<u8> {
        let mut frame = vec![slave, rtu::FC_READ_INPUT, (regs.len() * 2) as u8];
        for r in regs {
            frame.push((r >> 8) as u8);
            frame.push(*r as u8);
        }
        crc::append_crc(&mut frame);
        frame
    }

    fn fc03_response(slave: u8, regs: &[u16]) -> Vec<u8> {
        let mut frame = vec![slave, rtu::FC_READ_HOLDING, (regs.len() * 2) as u8];
        for r in regs {
            frame.push((r >> 8) as u8);
            frame.push(*r as u8);
        }
        crc::append_crc(&mut frame);
        frame
    }

    fn fc06_ack(slave: u8, addr: u16, value: u16) -> Vec<u8> {
        rtu::build_write_single(slave, addr, value)
    }

    #[tokio::test]
    async fn poll_assembles_snapshot_from_all_four_reads() {
        let transport = Arc::new(FakeTransport::new(vec![
            Ok(fc04_response(1, &[250, 500])),   // sensor
            Ok(fc03_response(2, &[0, 20000])),   // position
            Ok(fc03_response(2, &[0b110])),      // status
            Ok(fc03_response(3, &[3, 10, 0])),   // counter
        ]));
        let driver = DeviceDriver::new(transport, RtuConfig::default());
        let snap = driver.poll(&DeviceSnapshot::default()).await;
        assert_eq!(snap.temperature_tenths_c, 250);
        assert_eq!(snap.humidity_tenths_pct, 500);
        assert_eq!(snap.position, 20000);
        assert!(snap.in_position);
        assert!(snap.running);
        assert!(!snap.alarm);
        assert_eq!(snap.counter_value, 3);
        assert_eq!(snap.counter_target, 10);
        assert!(!snap.counter_done);
        assert!(snap.sensor_online);
        assert!(snap.driver_online);
    }

    #[tokio::test]
    async fn sensor_crc_failure_marks_offline_but_keeps_other_fields() {
        let mut bad_sensor = fc04_response(1, &[250, 500]);
        let last = bad_sensor.len() - 1;
        bad_sensor[last] ^= 0xFF;
        let transport = Arc::new(FakeTransport::new(vec![
            Ok(bad_sensor),
            Ok(fc03_response(2, &[0, 20000])),
            Ok(fc03_response(2, &[0])),
            Ok(fc03_response(3, &[0, 0, 0])),
        ]));
        let driver = DeviceDriver::new(transport, RtuConfig::default());
        let mut prev = DeviceSnapshot::default();
        prev.temperature_tenths_c = 999;
        let snap = driver.poll(&prev).await;
        assert!(!snap.sensor_online);
        assert_eq!(snap.temperature_tenths_c, 999);
    }

    #[tokio::test]
    async fn motor_move_abs_sends_expected_payload() {
        let transport = Arc::new(FakeTransport::new(vec![Ok(rtu::build_write_multiple(
            2,
            ADDR_MOVE_ABS,
            &[0x0000, 0x1388, 0x0000, 0x1F40],
        ))]));
        let driver = DeviceDriver::new(transport.clone(), RtuConfig::default());
        assert!(driver.motor_move_abs(5000, 8000).await);
        let sent = transport.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0][3..5], &[0x00, 0x20]);
    }

    #[tokio::test]
    async fn counter_reset_uses_fc06() {
        let transport = Arc::new(FakeTransport::new(vec![Ok(fc06_ack(3, ADDR_COUNTER_RESET, 1))]));
        let driver = DeviceDriver::new(transport, RtuConfig::default());
        assert!(driver.counter_reset().await);
    }
}
