mod bus;
mod command;
mod config;
mod lifecycle;
mod link;
mod modbus;
mod mqtt;
mod orchestrator;
mod sim;
mod state;
mod store;
mod update;
mod valve;
mod watchdog;

use anyhow::{Context, Result};
use rumqttc::AsyncClient;
use std::{env, path::Path, sync::Arc, thread, time::Duration};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bus::{BusTiming, BusTransport, ReadRetry};
use config::Config;
use lifecycle::{MaintenanceWindow, RestartReason};
use mqtt::{Listener, MqttLink, PubSub};
use orchestrator::{Maintenance, Orchestrator, Worker};
use state::SharedState;
use store::DeviceStore;
use update::{HttpSource, UpdateReconciler};
use valve::ValveController;
use watchdog::WatchdogSupervisor;

const DEFAULT_CONFIG_PATH: &str = "/etc/meter-controller/config.toml";

/// Outbound request buffer between the worker and the MQTT event loop.
const MQTT_CAPACITY: usize = 64;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path =
        env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let cfg = match config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = format!("{e:#}"), "cannot start without a valid config");
            lifecycle::fatal(RestartReason::ConfigInvalid)
        }
    };

    let reason = match run(&cfg, Path::new(&config_path)) {
        Ok(reason) => reason,
        Err(e) => RestartReason::LoopCrash(format!("{e:#}")),
    };
    lifecycle::fatal(reason)
}

/// Boot, start the threads and wait for the worker to ask for a restart.
fn run(cfg: &Config, config_path: &Path) -> Result<RestartReason> {
    info!(device_id = %cfg.device_id, addresses = ?cfg.addresses, "controller starting");

    // ── Modem ───────────────────────────────────────────────────────
    let mut modem = link::open_modem(&cfg.modem);
    if !link::wait_for_modem_cfg(modem.as_mut(), &cfg.modem) {
        return Ok(RestartReason::ModemInitTimeout);
    }

    // ── Shared state ────────────────────────────────────────────────
    let (shared, liveness) = SharedState::new();
    liveness.touch();

    // ── Updates (boot pass + maintenance schedule) ──────────────────
    let maintenance = if cfg.update.enabled {
        let reconciler = UpdateReconciler::new(
            Box::new(HttpSource::new(&cfg.update)),
            &cfg.update,
            &cfg.device_id,
            &cfg.storage.state_dir,
            config_path,
        );
        if cfg.update.reconcile_on_boot && reconciler.reconcile_all(&liveness) {
            return Ok(RestartReason::FirmwareUpdated);
        }
        let window = MaintenanceWindow::new(
            cfg.update.maintenance_hour,
            cfg.update.utc_offset_hours,
            &cfg.storage.state_dir,
        )?;
        Some(Maintenance {
            window,
            reconciler,
            restart_after: cfg.update.restart_after_maintenance,
        })
    } else {
        info!("over-the-air updates disabled");
        None
    };

    // ── Valves ──────────────────────────────────────────────────────
    let store = DeviceStore::open(&cfg.storage.state_dir)?;
    let port = bus::open_port(&cfg.bus, &cfg.addresses)?;
    let transport = BusTransport::new(port, BusTiming::from_config(&cfg.bus));
    let mut valves = ValveController::new(
        transport,
        store,
        ReadRetry::from_config(&cfg.bus),
        &cfg.addresses,
    );
    if let Some(default) = cfg.monitor.default_target_litres {
        for &address in &cfg.addresses {
            valves.seed_default_target(address, default)?;
        }
    }
    if cfg.monitor.self_test_on_boot {
        valves.self_test(&cfg.addresses);
    }

    // ── Watchdog ────────────────────────────────────────────────────
    let hw = watchdog::open_watchdog(&cfg.watchdog)?;
    let supervisor = WatchdogSupervisor::new(hw, shared.liveness.clone(), &cfg.watchdog);
    thread::Builder::new()
        .name("watchdog".into())
        .spawn(move || supervisor.run())
        .context("failed to spawn watchdog thread")?;

    // ── MQTT ────────────────────────────────────────────────────────
    let (client, eventloop) = AsyncClient::new(mqtt::client_options(cfg), MQTT_CAPACITY);
    let listener = Listener {
        client: client.clone(),
        eventloop,
        topics: mqtt::subscribe_topics(cfg),
        addresses: cfg.addresses.clone(),
        queue: Arc::clone(&shared.queue),
        health: Arc::clone(&shared.link),
    };
    thread::Builder::new()
        .name("mqtt".into())
        .spawn(move || {
            if let Err(e) = listener.run() {
                error!(error = format!("{e:#}"), "mqtt listener stopped");
                lifecycle::fatal(RestartReason::PubSubDead);
            }
        })
        .context("failed to spawn mqtt thread")?;
    let pubsub: Arc<dyn PubSub> = Arc::new(MqttLink::new(
        client,
        Arc::clone(&shared.link),
        Duration::from_secs(cfg.mqtt.keep_alive_secs),
    ));

    // ── Worker ──────────────────────────────────────────────────────
    let worker = Worker::new(cfg, valves, pubsub, Arc::clone(&shared.queue));
    let mut orchestrator = Orchestrator::new(cfg, worker, liveness, modem, shared.booted);
    if let Some(m) = maintenance {
        orchestrator = orchestrator.with_maintenance(m);
    }
    let handle = thread::Builder::new()
        .name("worker".into())
        .spawn(move || orchestrator.run())
        .context("failed to spawn worker thread")?;

    Ok(handle.join().unwrap_or(RestartReason::WorkerPanicked))
}
