//! Supervisor Relay (C9): the relay-tier role. Replaces the serial Device
//! Driver and AUTO Engine with a Modbus TCP client pointed at a remote Field
//! Controller, polling its Input Registers and forwarding JSON commands as
//! writes against its Holding Registers.

use crate::command::CmdCode;
use crate::config::SupervisorConfig;
use crate::json_server::{CommandSink, StatusView};
use crate::register_image::{HR_CMD_BASE, HR_MODE, HR_TARGET};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_modbus::client::{tcp, Context};
use tokio_modbus::prelude::*;
use tracing::{info, warn};

const IR_COUNT: u16 = 12;
const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(10);

/// Source codes written into the MANUAL packet's SOURCE slot (HR[14]),
/// fixed per the spec regardless of what a legacy client might send.
const SOURCE_SUPERVISOR: u16 = 2;
const SOURCE_OPERATOR: u16 = 3;

/// Owns the connection to a remote Field Controller. Reconnects on any
/// read/write failure with exponential backoff capped at 10 s.
pub struct SupervisorRelay {
    addr: SocketAddr,
    unit_id: u8,
    ctx: Mutex<Option<Context>>,
}

impl SupervisorRelay {
    pub fn new(cfg: &SupervisorConfig) -> Self {
        let addr: SocketAddr = format!("{}:{}", cfg.remote_host, cfg.remote_port)
            .parse()
            .unwrap_or_else(|_| "127.0.0.1:502".parse().unwrap());
        SupervisorRelay { addr, unit_id: 1, ctx: Mutex::new(None) }
    }

    async fn ensure_connected(&self) -> bool {
        let mut guard = self.ctx.lock().await;
        if guard.is_some() {
            return true;
        }
        match tcp::connect_slave(self.addr, Slave(self.unit_id)).await {
            Ok(ctx) => {
                info!(addr = %self.addr, "connected to remote Field Controller");
                *guard = Some(ctx);
                true
            }
            Err(e) => {
                warn!(addr = %self.addr, error = %e, "failed to connect to remote Field Controller");
                false
            }
        }
    }

    async fn drop_connection(&self) {
        *self.ctx.lock().await = None;
    }

    async fn read_input_registers(&self, addr: u16, count: u16) -> Option<Vec<u16>> {
        if !self.ensure_connected().await {
            return None;
        }
        let mut guard = self.ctx.lock().await;
        let ctx = guard.as_mut()?;
        match ctx.read_input_registers(addr, count).await {
            Ok(Ok(regs)) => Some(regs),
            Ok(Err(exc)) => {
                warn!(%exc, "remote Field Controller returned an exception on read");
                None
            }
            Err(e) => {
                warn!(error = %e, "IO error reading remote Input Registers");
                drop(guard);
                self.drop_connection().await;
                None
            }
        }
    }

    async fn write_single_register(&self, addr: u16, value: u16) -> bool {
        if !self.ensure_connected().await {
            return false;
        }
        let mut guard = self.ctx.lock().await;
        let ctx = match guard.as_mut() {
            Some(ctx) => ctx,
            None => return false,
        };
        match ctx.write_single_register(addr, value).await {
            Ok(Ok(())) => true,
            Ok(Err(exc)) => {
                warn!(%exc, "remote Field Controller rejected a write");
                false
            }
            Err(e) => {
                warn!(error = %e, "IO error writing remote Holding Register");
                drop(guard);
                self.drop_connection().await;
                false
            }
        }
    }

    async fn write_multiple_registers(&self, addr: u16, values: &[u16]) -> bool {
        if !self.ensure_connected().await {
            return false;
        }
        let mut guard = self.ctx.lock().await;
        let ctx = match guard.as_mut() {
            Some(ctx) => ctx,
            None => return false,
        };
        match ctx.write_multiple_registers(addr, values).await {
            Ok(Ok(())) => true,
            Ok(Err(exc)) => {
                warn!(%exc, "remote Field Controller rejected a multi-register write");
                false
            }
            Err(e) => {
                warn!(error = %e, "IO error writing remote Holding Registers");
                drop(guard);
                self.drop_connection().await;
                false
            }
        }
    }
}

fn parse_status(regs: &[u16]) -> StatusView {
    let position = crate::rtu::regs_to_s32(regs[0], regs[1]);
    let status_word = regs[5];
    StatusView {
        position,
        speed: regs[2],
        temperature_tenths_c: regs[3] as i16,
        humidity_tenths_pct: regs[4],
        alarm: status_word & 0b001 != 0,
        in_position: status_word & 0b010 != 0,
        running: status_word & 0b100 != 0,
        counter_value: regs[6],
        counter_target: regs[7],
        auto_state_code: regs[8],
        mode: regs[9],
        step_enabled: regs[10] != 0,
        jog_state_code: regs[11],
        connected: true,
    }
}

/// Polls the remote Field Controller's Input Registers every `interval` and
/// publishes the decoded status to `status_tx`, backing off on failure.
pub async fn run_poller(
    relay: std::sync::Arc<SupervisorRelay>,
    interval: Duration,
    status_tx: watch::Sender<StatusView>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = RECONNECT_INITIAL;
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match relay.read_input_registers(0, IR_COUNT).await {
                    Some(regs) if regs.len() == IR_COUNT as usize => {
                        backoff = RECONNECT_INITIAL;
                        let view = parse_status(&regs);
                        status_tx.send_replace(view);
                    }
                    _ => {
                        let mut disconnected = status_tx.borrow().clone();
                        disconnected.connected = false;
                        status_tx.send_replace(disconnected);
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(RECONNECT_CAP);
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Adapts the Supervisor Relay to the JSON server's [`CommandSink`] port:
/// motion commands become a MANUAL packet write at HR[10..15] on the remote
/// Field Controller rather than a local serial transaction.
pub struct SupervisorSink {
    relay: std::sync::Arc<SupervisorRelay>,
}

impl SupervisorSink {
    pub fn new(relay: std::sync::Arc<SupervisorRelay>) -> Self {
        SupervisorSink { relay }
    }
}

#[async_trait]
impl CommandSink for SupervisorSink {
    async fn submit_motion(&self, cmd_code: CmdCode, position: Option<i32>, speed: Option<u32>, priority: u8) {
        let (pos_hi, pos_lo) = crate::rtu::s32_to_regs(position.unwrap_or(0));
        let speed_lo = speed.unwrap_or(0) as u16;
        let source = if priority >= 3 { SOURCE_OPERATOR } else { SOURCE_SUPERVISOR };
        let packet = [cmd_code as u16, pos_hi, pos_lo, speed_lo, source, priority as u16];
        if !self.relay.write_multiple_registers(HR_CMD_BASE, &packet).await {
            warn!(cmd_code = ?cmd_code, "failed to forward MANUAL packet to remote Field Controller");
        }
    }

    async fn set_mode(&self, mode: u16) {
        self.relay.write_single_register(HR_MODE, mode).await;
    }

    async fn set_target(&self, target: u16) {
        self.relay.write_single_register(HR_TARGET, target).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status_matches_s6_scenario() {
        let regs = [0, 20000, 8000, 250, 500, 0b110, 3, 10, 2, 0, 1, 0];
        let view = parse_status(&regs);
        assert_eq!(view.position, 20000);
        assert_eq!(view.speed, 8000);
        assert_eq!(view.temperature_tenths_c, 250);
        assert_eq!(view.humidity_tenths_pct, 500);
        assert!(!view.alarm);
        assert!(view.in_position);
        assert!(view.running);
        assert_eq!(view.counter_value, 3);
        assert_eq!(view.counter_target, 10);
        assert_eq!(view.auto_state_code, 2);
        assert_eq!(view.mode, 0);
        assert!(view.step_enabled);
        assert_eq!(view.jog_state_code, 0);
    }

    #[test]
    fn source_code_is_fixed_regardless_of_legacy_priority_encoding() {
        assert_eq!(if 3u8 >= 3 { SOURCE_OPERATOR } else { SOURCE_SUPERVISOR }, 3);
        assert_eq!(if 2u8 >= 3 { SOURCE_OPERATOR } else { SOURCE_SUPERVISOR }, 2);
    }
}
