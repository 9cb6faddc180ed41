//! AUTO Engine (C8): drives the motor toward a pulse-counter target.

use crate::command::{CmdCode, CommandEnvelope, CommandRouter, Source};
use crate::config::AutoConfig;
use crate::device::DeviceSnapshot;
use crate::register_image::RegisterImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoState {
    Idle,
    WaitingCount,
    MotorRunning,
    WaitingReset,
    Alarm,
    TimeoutMotor,
    Disabled,
    WaitingTarget,
    Manual,
}

impl AutoState {
    pub fn code(self) -> u16 {
        match self {
            AutoState::Idle => 0,
            AutoState::WaitingCount => 1,
            AutoState::MotorRunning => 2,
            AutoState::WaitingReset => 3,
            AutoState::Alarm => 4,
            AutoState::TimeoutMotor => 5,
            AutoState::Disabled => 6,
            AutoState::WaitingTarget => 7,
            AutoState::Manual => 8,
        }
    }
}

struct EngineState {
    state: AutoState,
    last_cmd_ts: Instant,
    last_tcp_target: u16,
    last_mode: u16,
}

enum Action {
    None,
    MoveAbs,
    CounterReset,
}

pub struct AutoEngine {
    cfg: AutoConfig,
    registers: Arc<RegisterImage>,
    router: Arc<CommandRouter>,
    state: Mutex<EngineState>,
    forced_alarm: Arc<AtomicBool>,
}

impl AutoEngine {
    pub fn new(cfg: AutoConfig, registers: Arc<RegisterImage>, router: Arc<CommandRouter>) -> Self {
        let forced_alarm = router.forced_alarm_flag();
        AutoEngine {
            cfg,
            registers,
            router,
            state: Mutex::new(EngineState {
                state: AutoState::Idle,
                last_cmd_ts: Instant::now(),
                last_tcp_target: 0,
                last_mode: 0,
            }),
            forced_alarm,
        }
    }

    pub async fn current_state(&self) -> AutoState {
        self.state.lock().await.state
    }

    /// Runs one AUTO tick given the latest Device Snapshot: decides the
    /// next state and any action while holding the state lock only for
    /// that decision, then performs the (async) device call outside the
    /// lock. Returns the resulting state so callers (and tests) can
    /// assert on transitions.
    pub async fn tick(&self, snapshot: &DeviceSnapshot) -> AutoState {
        let mode = self.registers.mode();
        let target = self.registers.target();

        let (next_state, action, target_changed) = {
            let mut st = self.state.lock().await;
            let mut action = Action::None;

            if mode != st.last_mode {
                st.last_mode = mode;
                self.forced_alarm.store(false, Ordering::SeqCst);
            }

            let target_changed = if target != st.last_tcp_target {
                st.last_tcp_target = target;
                target > 0
            } else {
                false
            };

            let alarmed = snapshot.alarm || self.forced_alarm.load(Ordering::SeqCst);

            if alarmed {
                st.state = AutoState::Alarm;
            } else if mode == 1 {
                st.state = AutoState::Manual;
            } else {
                if matches!(st.state, AutoState::Alarm | AutoState::Manual) {
                    st.state = AutoState::Idle;
                }
                if target == 0 {
                    st.state = AutoState::WaitingTarget;
                } else {
                    if st.state == AutoState::WaitingTarget {
                        st.state = AutoState::WaitingCount;
                    }
                    match st.state {
                        AutoState::WaitingCount | AutoState::TimeoutMotor | AutoState::Idle => {
                            if snapshot.counter_done {
                                action = Action::MoveAbs;
                                st.state = AutoState::MotorRunning;
                                st.last_cmd_ts = Instant::now();
                            } else {
                                st.state = AutoState::WaitingCount;
                            }
                        }
                        AutoState::MotorRunning => {
                            if snapshot.in_position {
                                action = Action::CounterReset;
                                st.state = AutoState::WaitingReset;
                                st.last_cmd_ts = Instant::now();
                            } else if st.last_cmd_ts.elapsed()
                                > Duration::from_secs(self.cfg.motor_timeout_s)
                            {
                                st.state = AutoState::TimeoutMotor;
                            }
                        }
                        AutoState::WaitingReset => {
                            if snapshot.counter_value == 0 && !snapshot.counter_done {
                                st.state = AutoState::Idle;
                            }
                        }
                        _ => {}
                    }
                }
            }

            (st.state, action, target_changed)
        };

        if target_changed {
            self.router.counter_set_target(target).await;
        }

        match action {
            Action::MoveAbs => {
                let env = CommandEnvelope {
                    cmd_code: CmdCode::MoveAbs,
                    position: Some(self.cfg.move_pulses),
                    speed: Some(self.cfg.move_speed),
                    source: Source::Local,
                    priority: 1,
                    ts: Instant::now(),
                };
                self.router.submit(env).await;
                info!("AUTO: counter target reached, motor move submitted");
            }
            Action::CounterReset => {
                self.router.counter_reset().await;
                info!("AUTO: motor in position, counter reset submitted");
            }
            Action::None => {}
        }

        next_state
    }
}

/// Runs the 200 ms AUTO tick loop until `shutdown` resolves.
pub async fn run(
    engine: Arc<AutoEngine>,
    latest_snapshot: tokio::sync::watch::Receiver<DeviceSnapshot>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = time::interval(Duration::from_millis(engine.cfg.tick_ms));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let snap = latest_snapshot.borrow().clone();
                engine.tick(&snap).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RtuConfig;
    use crate::device::DeviceDriver;
    use crate::serial::test_support::FakeTransport;

    fn make_engine(responses: Vec<Result<Vec<u8>, crate::error::TransportError>>) -> (AutoEngine, Arc<RegisterImage>) {
        let transport = Arc::new(FakeTransport::new(responses));
        let driver = Arc::new(DeviceDriver::new(transport, RtuConfig::default()));
        let router = Arc::new(CommandRouter::new(driver));
        let registers = Arc::new(RegisterImage::new());
        (AutoEngine::new(AutoConfig::default(), registers.clone(), router), registers)
    }

    #[tokio::test]
    async fn waits_for_target_before_waiting_count() {
        let (engine, _registers) = make_engine(vec![]);
        let snap = DeviceSnapshot::default();
        let state = engine.tick(&snap).await;
        assert_eq!(state, AutoState::WaitingTarget);
    }

    #[tokio::test]
    async fn counter_done_triggers_move_abs() {
        let ack = crate::rtu::build_write_multiple(2, 0x0020, &[0x0000, 0x1388, 0x0000, 0x1F40]);
        let (engine, registers) = make_engine(vec![Ok(ack)]);
        registers.write_single(crate::register_image::HR_TARGET, 3).unwrap();

        let mut snap = DeviceSnapshot::default();
        snap.counter_done = true;
        let state = engine.tick(&snap).await;
        assert_eq!(state, AutoState::MotorRunning);
    }

    #[tokio::test]
    async fn alarm_preempts_everything() {
        let (engine, registers) = make_engine(vec![]);
        registers.write_single(crate::register_image::HR_TARGET, 3).unwrap();
        let mut snap = DeviceSnapshot::default();
        snap.alarm = true;
        let state = engine.tick(&snap).await;
        assert_eq!(state, AutoState::Alarm);
    }

    #[tokio::test]
    async fn mode_manual_short_circuits_to_manual_state() {
        let (engine, registers) = make_engine(vec![]);
        registers.write_single(crate::register_image::HR_MODE, 1).unwrap();
        let snap = DeviceSnapshot::default();
        let state = engine.tick(&snap).await;
        assert_eq!(state, AutoState::Manual);
    }

    #[tokio::test]
    async fn emergency_forces_alarm_until_mode_toggle() {
        let stop_ack = crate::rtu::build_write_single(2, 0x0002, 1);
        let (engine, registers) = make_engine(vec![Ok(stop_ack)]);
        registers.write_single(crate::register_image::HR_TARGET, 3).unwrap();

        let env = CommandEnvelope::new(CmdCode::Emergency, Source::Json, 3);
        assert!(engine.router.submit(env).await);

        let snap = DeviceSnapshot::default();
        assert_eq!(engine.tick(&snap).await, AutoState::Alarm);

        // Toggling mode clears the forced alarm even though the device
        // itself never reported one.
        registers.write_single(crate::register_image::HR_MODE, 1).unwrap();
        engine.tick(&snap).await;
        registers.write_single(crate::register_image::HR_MODE, 0).unwrap();
        assert_ne!(engine.tick(&snap).await, AutoState::Alarm);
    }

    #[tokio::test]
    async fn emergency_during_manual_mode_still_reports_alarm() {
        // S4: mode=MANUAL with a JOG_CW in progress, then emergency_stop.
        // The published AUTO state must be Alarm (IR[8]=4), not Manual,
        // per the state graph's "Any | alarm=true -> Alarm" row.
        let jog_ack = crate::rtu::build_write_multiple(2, 0x0030, &[0, 50000, 0, 1]);
        let stop_ack = crate::rtu::build_write_single(2, 0x0002, 1);
        let (engine, registers) = make_engine(vec![Ok(jog_ack), Ok(stop_ack)]);
        registers.write_single(crate::register_image::HR_MODE, 1).unwrap();

        let mut jog = CommandEnvelope::new(CmdCode::JogCw, Source::Json, 3);
        jog.speed = Some(50000);
        assert!(engine.router.submit(jog).await);

        let snap = DeviceSnapshot::default();
        assert_eq!(engine.tick(&snap).await, AutoState::Manual);

        let emergency = CommandEnvelope::new(CmdCode::Emergency, Source::Json, 3);
        assert!(engine.router.submit(emergency).await);

        assert_eq!(engine.tick(&snap).await, AutoState::Alarm);
    }
}
