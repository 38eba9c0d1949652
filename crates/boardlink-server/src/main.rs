//! `boardlink` – websocket bridge for a VESC-style motor controller.
//!
//! Wires the pieces together at startup:
//!
//! 1. Structured logging (`RUST_LOG`, JSON via `BOARDLINK_LOG_FORMAT=json`).
//! 2. Config and persisted settings.
//! 3. The serial device link and its decoded-frame stream.
//! 4. The long-lived tasks: telemetry relay pump, ramp control loop, and
//!    the websocket accept loop.
//! 5. Ctrl-C → shutdown signal → final stop command → link drain.

mod config;
mod control;
mod server;
mod session;

use std::sync::{Arc, Mutex};

use boardlink_core::gate::SessionGate;
use boardlink_core::ramp::RampController;
use boardlink_core::relay::TelemetryRelay;
use boardlink_core::router::CommandRouter;
use boardlink_core::settings::SettingsStore;
use boardlink_vesc::link::{DeviceLink, SerialLink};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::control::ControlLoop;
use crate::session::SessionCoordinator;

fn init_logging() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    if std::env::var("BOARDLINK_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .compact()
            .init();
    }
}

#[tokio::main]
async fn main() {
    init_logging();

    let config_path = config::parse_config_path();
    let config = match config::load_from(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path, error = %e, "cannot load configuration");
            std::process::exit(1);
        }
    };
    info!(
        listen = %config.listen_addr,
        port = %config.serial_port,
        baud = config.baud_rate,
        can_id = config.can_id,
        "boardlink starting"
    );

    let settings_store = SettingsStore::load(&config.settings_path);
    let settings = settings_store.current().clone();

    let (serial, frames) = match SerialLink::open(&config.serial_port, config.baud_rate) {
        Ok(opened) => opened,
        Err(e) => {
            error!(error = %e, "cannot open device link");
            std::process::exit(1);
        }
    };
    let link: Arc<dyn DeviceLink> = Arc::new(serial);

    let ramp = Arc::new(Mutex::new(RampController::new(&settings)));
    let gate = Arc::new(SessionGate::new());
    let relay = Arc::new(TelemetryRelay::default());
    let settings = Arc::new(Mutex::new(settings_store));
    let router = Arc::new(CommandRouter::new(
        Arc::clone(&link),
        Arc::clone(&ramp),
        settings,
        Arc::clone(&relay),
        config.can_id,
    ));
    let coordinator = Arc::new(SessionCoordinator::new(
        Arc::clone(&gate),
        router,
        Arc::clone(&relay),
        Arc::clone(&ramp),
        Arc::clone(&link),
        config.can_id,
        config.stop_mode,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    {
        let shutdown_tx = Arc::clone(&shutdown_tx);
        if let Err(e) = ctrlc::set_handler(move || {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }) {
            warn!(error = %e, "cannot install Ctrl-C handler; kill the process to stop");
        }
    }

    let relay_task = tokio::spawn({
        let relay = Arc::clone(&relay);
        async move { relay.run(frames).await }
    });
    let control_task = tokio::spawn(
        ControlLoop::new(
            Arc::clone(&ramp),
            Arc::clone(&link),
            Arc::clone(&gate),
            config.can_id,
            config.tick(),
            config.telemetry_poll(),
            shutdown_rx.clone(),
        )
        .run(),
    );

    if let Err(e) = server::run(coordinator, &config.listen_addr, shutdown_rx).await {
        error!(error = %e, "websocket server failed");
    }

    // Reached on Ctrl-C or server failure: make sure the control loop sees
    // the signal, let it issue its final stop, then drain the link.
    let _ = shutdown_tx.send(true);
    if let Err(e) = control_task.await {
        warn!(error = %e, "control loop did not exit cleanly");
    }
    relay_task.abort();
    if let Err(e) = link.close().await {
        warn!(error = %e, "device link close failed");
    }
    info!("boardlink stopped");
}
