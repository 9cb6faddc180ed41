//! Command Router (C7): normalizes commands from three sources into a
//! single priority-arbitrated stream and applies them to the Device Driver.

use crate::device::{DeviceDriver, JogState};
use crate::json_server::CommandSink;
use crate::register_image::{RegisterImage, HR_CMD_BASE, HR_MODE, HR_TARGET};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdCode {
    StepOn = 1,
    StepOff = 2,
    MoveAbs = 3,
    JogCw = 5,
    JogCcw = 6,
    Stop = 7,
    ResetAlarm = 8,
    Emergency = 9,
}

impl CmdCode {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(CmdCode::StepOn),
            2 => Some(CmdCode::StepOff),
            3 => Some(CmdCode::MoveAbs),
            5 => Some(CmdCode::JogCw),
            6 => Some(CmdCode::JogCcw),
            7 => Some(CmdCode::Stop),
            8 => Some(CmdCode::ResetAlarm),
            9 => Some(CmdCode::Emergency),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Local,
    ManualPkt,
    Json,
}

#[derive(Debug, Clone)]
pub struct CommandEnvelope {
    pub cmd_code: CmdCode,
    pub position: Option<i32>,
    pub speed: Option<u32>,
    pub source: Source,
    pub priority: u8,
    pub ts: Instant,
}

impl CommandEnvelope {
    pub fn new(cmd_code: CmdCode, source: Source, priority: u8) -> Self {
        CommandEnvelope { cmd_code, position: None, speed: None, source, priority, ts: Instant::now() }
    }
}

const ARBITRATION_WINDOW: Duration = Duration::from_millis(50);

/// Funnels AUTO/MANUAL/JSON commands to the driver, dropping a lower
/// priority command that arrives within 50 ms of a higher priority one,
/// and letting EMERGENCY preempt everything by issuing STOP first.
pub struct CommandRouter {
    driver: Arc<DeviceDriver>,
    last: Mutex<Option<CommandEnvelope>>,
    forced_alarm: Arc<AtomicBool>,
    step_enabled: AtomicBool,
    jog_state: AtomicU8,
}

impl CommandRouter {
    pub fn new(driver: Arc<DeviceDriver>) -> Self {
        CommandRouter {
            driver,
            last: Mutex::new(None),
            forced_alarm: Arc::new(AtomicBool::new(false)),
            step_enabled: AtomicBool::new(false),
            jog_state: AtomicU8::new(JogState::Off.code() as u8),
        }
    }

    /// Shared with the AUTO engine so an EMERGENCY can force its state to
    /// `Alarm` until the next mode toggle, per the command translation table.
    pub fn forced_alarm_flag(&self) -> Arc<AtomicBool> {
        self.forced_alarm.clone()
    }

    /// The field controller has no register to read step/jog state back off
    /// the wire — IR[10]/IR[11] mirror the last command this router issued,
    /// not a device readback.
    pub fn commanded_step_enabled(&self) -> bool {
        self.step_enabled.load(Ordering::SeqCst)
    }

    pub fn commanded_jog_state(&self) -> JogState {
        match self.jog_state.load(Ordering::SeqCst) {
            1 => JogState::Cw,
            2 => JogState::Ccw,
            _ => JogState::Off,
        }
    }

    pub async fn submit(&self, envelope: CommandEnvelope) -> bool {
        if envelope.cmd_code == CmdCode::Emergency {
            warn!("EMERGENCY received, issuing STOP immediately");
            self.forced_alarm.store(true, Ordering::SeqCst);
            self.driver.motor_stop().await;
            self.jog_state.store(JogState::Off.code() as u8, Ordering::SeqCst);
            self.remember(envelope).await;
            return true;
        }

        if self.forced_alarm.load(Ordering::SeqCst) {
            info!(cmd_code = ?envelope.cmd_code, "dropped: forced Alarm state pending mode toggle");
            return false;
        }

        {
            let mut last = self.last.lock().await;
            if let Some(prev) = last.as_ref() {
                if envelope.ts.duration_since(prev.ts) < ARBITRATION_WINDOW && prev.priority > envelope.priority {
                    info!(
                        dropped_priority = envelope.priority,
                        kept_priority = prev.priority,
                        "dropped lower-priority command within arbitration window"
                    );
                    return false;
                }
            }
            *last = Some(envelope.clone());
        }

        self.dispatch(&envelope).await
    }

    async fn remember(&self, envelope: CommandEnvelope) {
        *self.last.lock().await = Some(envelope);
    }

    /// Direct passthrough to the counter device. Not part of the Command
    /// Envelope/arbitration scheme — only the AUTO engine ever calls these,
    /// to forward a changed HR[0] target or reset the counter after a
    /// completed move, per the AUTO state graph.
    pub async fn counter_set_target(&self, n: u16) -> bool {
        self.driver.counter_set_target(n).await
    }

    pub async fn counter_reset(&self) -> bool {
        self.driver.counter_reset().await
    }

    async fn dispatch(&self, envelope: &CommandEnvelope) -> bool {
        let ok = match envelope.cmd_code {
            CmdCode::StepOn => self.driver.motor_step(true).await,
            CmdCode::StepOff => self.driver.motor_step(false).await,
            CmdCode::MoveAbs => {
                let pos = envelope.position.unwrap_or(0);
                let speed = envelope.speed.unwrap_or(0);
                self.driver.motor_move_abs(pos, speed).await
            }
            CmdCode::JogCw => self.driver.motor_jog(true, envelope.speed.unwrap_or(0)).await,
            CmdCode::JogCcw => self.driver.motor_jog(false, envelope.speed.unwrap_or(0)).await,
            CmdCode::Stop => self.driver.motor_stop().await,
            CmdCode::ResetAlarm => self.driver.motor_reset_alarm().await,
            CmdCode::Emergency => self.driver.motor_stop().await,
        };
        if ok {
            self.track_commanded_state(envelope.cmd_code);
        } else {
            warn!(cmd_code = ?envelope.cmd_code, "device op failed; not retried by the router");
        }
        ok
    }

    /// IR[10]/IR[11] mirror the last STEP/JOG/STOP command this router
    /// successfully issued, since there is no RTU register to read the
    /// driver's step/jog state back.
    fn track_commanded_state(&self, cmd_code: CmdCode) {
        match cmd_code {
            CmdCode::StepOn => self.step_enabled.store(true, Ordering::SeqCst),
            CmdCode::StepOff => self.step_enabled.store(false, Ordering::SeqCst),
            CmdCode::JogCw => self.jog_state.store(JogState::Cw.code() as u8, Ordering::SeqCst),
            CmdCode::JogCcw => self.jog_state.store(JogState::Ccw.code() as u8, Ordering::SeqCst),
            CmdCode::Stop | CmdCode::Emergency => {
                self.jog_state.store(JogState::Off.code() as u8, Ordering::SeqCst)
            }
            CmdCode::MoveAbs | CmdCode::ResetAlarm => {}
        }
    }
}

/// Watches the Register Image's MANUAL packet slots (HR[10..15]) and, while
/// `mode == MANUAL`, turns a non-zero `cmd_code` into a Command Envelope and
/// submits it. While `mode == AUTO` a non-zero HR[10] is left untouched —
/// neither executed nor cleared — until the operator flips back to MANUAL.
pub async fn run_manual_watcher(
    router: Arc<CommandRouter>,
    registers: Arc<RegisterImage>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut hr_rx = registers.subscribe_hr();
    loop {
        tokio::select! {
            changed = hr_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let regs = hr_rx.borrow().registers;
                if regs[HR_MODE as usize] != 1 {
                    continue;
                }
                let base = HR_CMD_BASE as usize;
                let cmd = regs[base];
                if cmd == 0 {
                    continue;
                }
                match CmdCode::from_u16(cmd) {
                    Some(cmd_code) => {
                        let position = Some(crate::rtu::regs_to_s32(regs[base + 1], regs[base + 2]));
                        let speed = Some(regs[base + 3] as u32);
                        let priority = regs[base + 5].clamp(1, 3) as u8;
                        let envelope = CommandEnvelope {
                            cmd_code,
                            position,
                            speed,
                            source: Source::ManualPkt,
                            priority,
                            ts: Instant::now(),
                        };
                        router.submit(envelope).await;
                    }
                    None => warn!(cmd, "unknown MANUAL packet cmd_code, ignoring"),
                }
                registers.clear_cmd_slot();
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Adapts the Command Router + Register Image pair to the JSON server's
/// [`CommandSink`] port, used when running the Field Controller role.
pub struct FieldControllerSink {
    registers: Arc<RegisterImage>,
    router: Arc<CommandRouter>,
}

impl FieldControllerSink {
    pub fn new(registers: Arc<RegisterImage>, router: Arc<CommandRouter>) -> Self {
        FieldControllerSink { registers, router }
    }
}

#[async_trait]
impl CommandSink for FieldControllerSink {
    async fn submit_motion(&self, cmd_code: CmdCode, position: Option<i32>, speed: Option<u32>, priority: u8) {
        let env = CommandEnvelope { cmd_code, position, speed, source: Source::Json, priority, ts: Instant::now() };
        self.router.submit(env).await;
    }

    async fn set_mode(&self, mode: u16) {
        self.registers.write_single(HR_MODE, mode).ok();
    }

    async fn set_target(&self, target: u16) {
        self.registers.write_single(HR_TARGET, target).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RtuConfig;
    use crate::serial::test_support::FakeTransport;
    use std::sync::Arc;

    fn make_router(responses: Vec<Result<Vec<u8>, crate::error::TransportError>>) -> CommandRouter {
        let transport = Arc::new(FakeTransport::new(responses));
        let driver = Arc::new(DeviceDriver::new(transport, RtuConfig::default()));
        CommandRouter::new(driver)
    }

    #[tokio::test]
    async fn emergency_issues_stop_immediately() {
        let ack = crate::rtu::build_write_single(2, 0x0002, 1);
        let router = make_router(vec![Ok(ack)]);
        let env = CommandEnvelope::new(CmdCode::Emergency, Source::Json, 3);
        assert!(router.submit(env).await);
    }

    #[tokio::test]
    async fn lower_priority_dropped_within_arbitration_window() {
        let router = make_router(vec![]);
        let mut high = CommandEnvelope::new(CmdCode::Stop, Source::Json, 3);
        high.ts = Instant::now();
        *router.last.lock().await = Some(high);

        let low = CommandEnvelope::new(CmdCode::StepOn, Source::Local, 1);
        assert!(!router.submit(low).await);
    }

    #[tokio::test]
    async fn emergency_drops_subsequent_commands_until_mode_toggle() {
        let ack = crate::rtu::build_write_single(2, 0x0002, 1);
        let router = make_router(vec![Ok(ack)]);
        let emergency = CommandEnvelope::new(CmdCode::Emergency, Source::Json, 3);
        assert!(router.submit(emergency).await);

        let follow_up = CommandEnvelope::new(CmdCode::JogCw, Source::Json, 3);
        assert!(!router.submit(follow_up).await);
    }

    #[tokio::test]
    async fn manual_watcher_ignores_packet_while_mode_is_auto() {
        let transport = Arc::new(FakeTransport::new(vec![]));
        let driver = Arc::new(DeviceDriver::new(transport, crate::config::RtuConfig::default()));
        let router = Arc::new(CommandRouter::new(driver));
        let registers = Arc::new(RegisterImage::new());

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let watcher = tokio::spawn(run_manual_watcher(router.clone(), registers.clone(), shutdown_rx));

        registers.write_multiple(HR_CMD_BASE, &[CmdCode::Stop as u16, 0, 0, 0, 3, 3]).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registers.cmd_packet()[0], CmdCode::Stop as u16);

        shutdown_tx.send(true).unwrap();
        watcher.await.unwrap();
    }
}
