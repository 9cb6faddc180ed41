//! Process composition root. Loads configuration, initializes logging, then
//! builds either the Field Controller graph or the Supervisor graph
//! depending on the configured role, spawning one task per component and
//! waiting on a shutdown signal before draining.

use clap::Parser;
use modbus_gateway_lib::auto_engine::AutoEngine;
use modbus_gateway_lib::command::{CommandRouter, FieldControllerSink};
use modbus_gateway_lib::config::{Config, Role};
use modbus_gateway_lib::device::{DeviceDriver, DeviceSnapshot};
use modbus_gateway_lib::error::GatewayError;
use modbus_gateway_lib::json_server::{CommandSink, StatusView};
use modbus_gateway_lib::register_image::RegisterImage;
use modbus_gateway_lib::serial::{SerialTransport, Transact};
use modbus_gateway_lib::supervisor::{SupervisorRelay, SupervisorSink};
use modbus_gateway_lib::{command, json_server, logging, modbus_server, supervisor};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "modbus-gateway", about = "Modbus RTU/TCP industrial control gateway")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, env = "GATEWAY_CONFIG", default_value = "gateway.toml")]
    config: std::path::PathBuf,
}

const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type TaskHandle = tokio::task::JoinHandle<()>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let cfg = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };

    logging::init(&cfg.logging.level);
    info!(role = ?cfg.role, "starting modbus-gateway");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handles = match cfg.role {
        Role::FieldController => run_field_controller(&cfg, shutdown_rx).await,
        Role::Supervisor => run_supervisor(&cfg, shutdown_rx).await,
    };

    let handles = match handles {
        Ok(h) => h,
        Err(e) => {
            error!(error = %e, "fatal startup failure");
            std::process::exit(1);
        }
    };

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining tasks");
    let _ = shutdown_tx.send(true);

    let drain = futures::future::join_all(handles);
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        info!("drain timeout elapsed, exiting anyway");
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, GatewayError> {
    TcpListener::bind(addr).await.map_err(|e| GatewayError::Bind(addr.to_string(), e))
}

async fn run_field_controller(
    cfg: &Config,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<Vec<TaskHandle>> {
    // Bind both listening sockets before spawning any task, so an
    // unbindable port is a startup failure rather than a mid-run surprise.
    let modbus_listener = bind(([0, 0, 0, 0], cfg.tcp.modbus_port).into()).await?;
    let json_listener = bind(([0, 0, 0, 0], cfg.tcp.json_port).into()).await?;

    let transport: Arc<dyn Transact> = Arc::new(SerialTransport::open(&cfg.serial).map_err(GatewayError::Transport)?);
    let driver = Arc::new(DeviceDriver::new(transport, cfg.rtu.clone()));
    let registers = Arc::new(RegisterImage::new());
    let router = Arc::new(CommandRouter::new(driver.clone()));
    let engine = Arc::new(AutoEngine::new(cfg.auto.clone(), registers.clone(), router.clone()));
    let sink: Arc<dyn CommandSink> = Arc::new(FieldControllerSink::new(registers.clone(), router.clone()));

    let (snapshot_tx, snapshot_rx) = watch::channel(DeviceSnapshot::default());
    let (status_tx, status_rx) = watch::channel(StatusView { connected: true, ..StatusView::default() });

    let mut handles = Vec::new();

    handles.push(tokio::spawn(run_device_poller(
        driver,
        engine.clone(),
        router.clone(),
        registers.clone(),
        Duration::from_millis(cfg.poll.device_ms),
        snapshot_tx,
        status_tx,
        shutdown_rx.clone(),
    )));

    handles.push(tokio::spawn(modbus_gateway_lib::auto_engine::run(
        engine,
        snapshot_rx,
        shutdown_rx.clone(),
    )));

    handles.push(tokio::spawn(command::run_manual_watcher(
        router,
        registers.clone(),
        shutdown_rx.clone(),
    )));

    handles.push(spawn_server(modbus_server::run(registers, modbus_listener, shutdown_rx.clone())));
    handles.push(spawn_server(json_server::run(sink, cfg.limits.clone(), status_rx, json_listener, shutdown_rx)));

    Ok(handles)
}

async fn run_supervisor(
    cfg: &Config,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<Vec<TaskHandle>> {
    let json_listener = bind(([0, 0, 0, 0], cfg.tcp.json_port).into()).await?;

    let relay = Arc::new(SupervisorRelay::new(&cfg.supervisor));
    let sink: Arc<dyn CommandSink> = Arc::new(SupervisorSink::new(relay.clone()));
    let (status_tx, status_rx) =
        watch::channel(StatusView { connected: false, ..StatusView::default() });

    let mut handles = Vec::new();
    handles.push(tokio::spawn(supervisor::run_poller(
        relay,
        Duration::from_millis(cfg.poll.supervisor_ms),
        status_tx,
        shutdown_rx.clone(),
    )));

    handles.push(spawn_server(json_server::run(sink, cfg.limits.clone(), status_rx, json_listener, shutdown_rx)));

    Ok(handles)
}

/// Runs an already-bound server `run` future to completion. Post-bind I/O
/// errors (a peer resetting a connection mid-accept, say) are logged and
/// the task simply ends — only the initial bind is fatal to the process.
fn spawn_server<F>(fut: F) -> TaskHandle
where
    F: std::future::Future<Output = std::io::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            error!(error = %e, "server task ended with an I/O error");
        }
    })
}

/// Polls the Device Driver every `interval`, publishing the resulting
/// snapshot into the Register Image's Input Registers, the AUTO engine's
/// snapshot channel, and the JSON server's status channel — the single
/// producer of all three downstream views.
async fn run_device_poller(
    driver: Arc<DeviceDriver>,
    engine: Arc<AutoEngine>,
    router: Arc<CommandRouter>,
    registers: Arc<RegisterImage>,
    interval: Duration,
    snapshot_tx: watch::Sender<DeviceSnapshot>,
    status_tx: watch::Sender<StatusView>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut previous = DeviceSnapshot::default();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                previous = driver.poll(&previous).await;
                // Step/jog readback doesn't exist on the wire; mirror the
                // Command Router's record of the last command it issued.
                previous.step_enabled = router.commanded_step_enabled();
                previous.jog_state = router.commanded_jog_state();
                let _ = snapshot_tx.send(previous.clone());

                let mode = registers.mode();
                let auto_state_code = engine.current_state().await.code();
                registers.publish_snapshot(&previous, auto_state_code, mode);

                status_tx.send_replace(StatusView {
                    position: previous.position,
                    speed: previous.speed,
                    temperature_tenths_c: previous.temperature_tenths_c,
                    humidity_tenths_pct: previous.humidity_tenths_pct,
                    alarm: previous.alarm,
                    in_position: previous.in_position,
                    running: previous.running,
                    counter_value: previous.counter_value,
                    counter_target: previous.counter_target,
                    auto_state_code,
                    mode,
                    step_enabled: previous.step_enabled,
                    jog_state_code: previous.jog_state.code(),
                    connected: true,
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
