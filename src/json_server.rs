//! TCP Server (C6): line-delimited JSON command server for operator clients.
//!
//! At most one accepted client at a time; accepting a new connection
//! forcibly drops whichever client was previously attached, mirroring the
//! single-slot behavior of the reference operator-facing TCP server.
//!
//! Commands are routed through a [`CommandSink`] rather than straight to the
//! Command Router, so the same server serves both roles: the Field
//! Controller (HR writes + Command Router) and the Supervisor (HR writes on
//! a remote Modbus TCP connection).

use crate::command::CmdCode;
use crate::config::LimitsConfig;
use crate::error::ValidationError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Everything the JSON server needs to act on a parsed command, independent
/// of whether the motion ends up on the local serial bus (Field Controller)
/// or a remote Field Controller's register image (Supervisor).
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn submit_motion(&self, cmd_code: CmdCode, position: Option<i32>, speed: Option<u32>, priority: u8);
    async fn set_mode(&self, mode: u16);
    async fn set_target(&self, target: u16);
}

/// A snapshot of process/device status in the shape the `status` JSON
/// notification is built from, independent of where it was assembled.
#[derive(Debug, Clone, Default)]
pub struct StatusView {
    pub position: i32,
    pub speed: u16,
    pub temperature_tenths_c: i16,
    pub humidity_tenths_pct: u16,
    pub alarm: bool,
    pub in_position: bool,
    pub running: bool,
    pub counter_value: u16,
    pub counter_target: u16,
    pub auto_state_code: u16,
    pub mode: u16,
    pub step_enabled: bool,
    pub jog_state_code: u16,
    pub connected: bool,
}

#[derive(Debug, Deserialize)]
struct Inbound {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    priority: Option<u8>,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Serialize)]
struct StatusNotification {
    #[serde(rename = "type")]
    kind: &'static str,
    timestamp: u64,
    data: StatusData,
}

#[derive(Debug, Serialize)]
struct StatusData {
    position: i32,
    speed: u16,
    temperature: f64,
    humidity: f64,
    driver_alarm: bool,
    driver_inpos: bool,
    driver_running: bool,
    counter_value: u16,
    counter_target: u16,
    auto_state_code: u16,
    mode: u16,
    step_enabled: bool,
    jog_state: u16,
    connected: bool,
}

/// Accepts JSON operator connections on an already-bound `listener` until
/// `shutdown` resolves. The listener is bound by the caller (the
/// composition root) so a failure to bind is observed before any task is
/// spawned.
pub async fn run(
    sink: Arc<dyn CommandSink>,
    limits: LimitsConfig,
    status_rx: watch::Receiver<StatusView>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "JSON TCP server listening");
    let current: Arc<Mutex<Option<AbortHandle>>> = Arc::new(Mutex::new(None));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                if let Some(prev) = current.lock().await.take() {
                    warn!(%peer, "new JSON client displaces previous connection");
                    prev.abort();
                }
                let sink = sink.clone();
                let limits = limits.clone();
                let status_rx = status_rx.clone();
                let conn_shutdown = shutdown.clone();
                let handle = tokio::spawn(async move {
                    info!(%peer, "JSON client connected");
                    handle_client(stream, sink, limits, status_rx, conn_shutdown).await;
                    info!(%peer, "JSON client disconnected");
                });
                *current.lock().await = Some(handle.abort_handle());
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn handle_client(
    stream: tokio::net::TcpStream,
    sink: Arc<dyn CommandSink>,
    limits: LimitsConfig,
    mut status_rx: watch::Receiver<StatusView>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if let Err(e) = handle_line(&line, sink.as_ref(), &limits).await {
                            warn!(error = %e, "rejected JSON command");
                        }
                    }
                    _ => break,
                }
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = status_rx.borrow().clone();
                let notification = build_status(&view);
                let Ok(text) = serde_json::to_string(&notification) else { continue };
                if write_half.write_all(format!("{text}\n").as_bytes()).await.is_err() {
                    break;
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

async fn handle_line(line: &str, sink: &dyn CommandSink, limits: &LimitsConfig) -> Result<(), ValidationError> {
    let msg: Inbound = serde_json::from_str(line).map_err(|e| ValidationError::Malformed(e.to_string()))?;
    debug!(kind = %msg.kind, "JSON command received");
    let priority = msg.priority.unwrap_or(3).clamp(1, 3);

    match msg.kind.as_str() {
        "heartbeat" => Ok(()),
        "set_mode" => {
            let mode = field_u16(&msg.data, "mode")?;
            sink.set_mode(mode).await;
            Ok(())
        }
        "set_target" => {
            let target = field_u16(&msg.data, "target")?;
            check_range("target", target as i64, 1, limits.target_max as i64)?;
            sink.set_target(target).await;
            Ok(())
        }
        "motor_control" => handle_motor_control(&msg.data, sink, priority, limits).await,
        "jog_control" => {
            let speed = field_i64(&msg.data, "speed")?;
            check_range("speed", speed, 1, limits.speed_max as i64)?;
            let speed = speed as u32;
            let direction = field_i64(&msg.data, "direction")?;
            let cmd_code = if direction >= 0 { CmdCode::JogCw } else { CmdCode::JogCcw };
            sink.submit_motion(cmd_code, None, Some(speed), priority).await;
            Ok(())
        }
        "stop_motor" => {
            sink.submit_motion(CmdCode::Stop, None, None, priority).await;
            Ok(())
        }
        "release_control" => {
            sink.submit_motion(CmdCode::Stop, None, None, 1).await;
            Ok(())
        }
        "emergency_stop" => {
            sink.submit_motion(CmdCode::Emergency, None, None, priority).await;
            Ok(())
        }
        other => Err(ValidationError::UnknownType(other.to_string())),
    }
}

async fn handle_motor_control(
    data: &Value,
    sink: &dyn CommandSink,
    priority: u8,
    limits: &LimitsConfig,
) -> Result<(), ValidationError> {
    if let (Some(position), Some(speed)) = (data.get("position"), data.get("speed")) {
        let position = position.as_i64().ok_or_else(|| ValidationError::MissingField("position".to_string()))?;
        let speed = speed.as_i64().ok_or_else(|| ValidationError::MissingField("speed".to_string()))?;
        check_range("position", position, -limits.pos_abs_max, limits.pos_abs_max)?;
        check_range("speed", speed, 1, limits.speed_max as i64)?;
        sink.submit_motion(CmdCode::MoveAbs, Some(position as i32), Some(speed as u32), priority).await;
        return Ok(());
    }
    if let Some(step) = data.get("step_command").and_then(Value::as_str) {
        let cmd_code = match step {
            "on" => CmdCode::StepOn,
            "off" => CmdCode::StepOff,
            other => return Err(ValidationError::Malformed(format!("unknown step_command '{other}'"))),
        };
        sink.submit_motion(cmd_code, None, None, priority).await;
        return Ok(());
    }
    if data.get("alarm_reset").and_then(Value::as_bool) == Some(true) {
        sink.submit_motion(CmdCode::ResetAlarm, None, None, priority).await;
        return Ok(());
    }
    Err(ValidationError::MissingField("motor_control data".to_string()))
}

fn field_u16(data: &Value, field: &str) -> Result<u16, ValidationError> {
    data.get(field)
        .and_then(Value::as_u64)
        .map(|v| v as u16)
        .ok_or_else(|| ValidationError::MissingField(field.to_string()))
}

fn field_i64(data: &Value, field: &str) -> Result<i64, ValidationError> {
    data.get(field).and_then(Value::as_i64).ok_or_else(|| ValidationError::MissingField(field.to_string()))
}

/// Rejects a field outside `[min, max]`, per the configured `limits.*`
/// bounds — the JSON boundary's validation-failure policy (§7): logged and
/// dropped, connection kept.
fn check_range(field: &str, value: i64, min: i64, max: i64) -> Result<(), ValidationError> {
    if value < min || value > max {
        return Err(ValidationError::OutOfRange { field: field.to_string(), value });
    }
    Ok(())
}

fn build_status(view: &StatusView) -> StatusNotification {
    StatusNotification {
        kind: "status",
        timestamp: chrono::Utc::now().timestamp_millis() as u64,
        data: StatusData {
            position: view.position,
            speed: view.speed,
            temperature: view.temperature_tenths_c as f64 / 10.0,
            humidity: view.humidity_tenths_pct as f64 / 10.0,
            driver_alarm: view.alarm,
            driver_inpos: view.in_position,
            driver_running: view.running,
            counter_value: view.counter_value,
            counter_target: view.counter_target,
            auto_state_code: view.auto_state_code,
            mode: view.mode,
            step_enabled: view.step_enabled,
            jog_state: view.jog_state_code,
            connected: view.connected,
        },
    }
}
