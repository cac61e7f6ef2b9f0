//! The worker cycle: command drain, link check, one valve pass per meter,
//! then a checkpointed sleep. Runs on its own thread and owns the bus.

use anyhow::Result;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::command::{Command, CommandKind, CommandQueue, StatusTag};
use crate::config::Config;
use crate::lifecycle::{MaintenanceWindow, MemoryGuard, RestartReason};
use crate::link::{LinkStatus, LinkSupervisor, Modem};
use crate::mqtt::{publish_json, publish_topic, PubSub, StatusReport, TelemetryReport};
use crate::update::UpdateReconciler;
use crate::valve::{TokenLoadOutcome, ValveController};
use crate::watchdog::LivenessWriter;

// ---------------------------------------------------------------------------
// Worker: commands and monitoring
// ---------------------------------------------------------------------------

/// Owns the valves and answers over pub/sub.
pub(crate) struct Worker {
    addresses: Vec<u8>,
    topic: String,
    valves: ValveController,
    pubsub: Arc<dyn PubSub>,
    queue: Arc<CommandQueue>,
}

impl Worker {
    pub(crate) fn new(
        cfg: &Config,
        valves: ValveController,
        pubsub: Arc<dyn PubSub>,
        queue: Arc<CommandQueue>,
    ) -> Self {
        Self {
            addresses: cfg.addresses.clone(),
            topic: publish_topic(&cfg.device_id),
            valves,
            pubsub,
            queue,
        }
    }

    fn process(&mut self, cmd: &Command) -> StatusTag {
        match cmd.kind {
            CommandKind::TokenLoad { litres } => {
                match self.valves.apply_token_load(cmd.address, litres) {
                    Ok(TokenLoadOutcome::Applied { new_target, pass }) => {
                        info!(
                            address = cmd.address,
                            new_target,
                            state = %pass.state,
                            "token load applied"
                        );
                        StatusTag::LoadSuccess
                    }
                    Ok(TokenLoadOutcome::Ignored) => StatusTag::LoadFailure,
                    Err(e) => {
                        error!(
                            address = cmd.address,
                            litres,
                            error = format!("{e:#}"),
                            "token load failed"
                        );
                        StatusTag::LoadFailure
                    }
                }
            }
            CommandKind::ValveOpen => {
                self.valves.open(cmd.address);
                StatusTag::ValveOpen
            }
            CommandKind::ValveClose => {
                self.valves.close(cmd.address);
                StatusTag::ValveClosed
            }
        }
    }

    /// Process every queued command, oldest first, each answered by exactly
    /// one status report. Returns how many were processed.
    pub(crate) fn drain_commands(&mut self) -> usize {
        if self.queue.is_empty() {
            return 0;
        }
        info!(pending = self.queue.len(), "draining commands");
        let mut processed = 0;
        while let Some(cmd) = self.queue.pop() {
            info!(address = cmd.address, kind = %cmd.kind, "processing command");
            let status = self.process(&cmd);
            let report = StatusReport::new(&cmd.external_id, status);
            if let Err(e) = publish_json(self.pubsub.as_ref(), &self.topic, &report) {
                warn!(
                    device = %cmd.external_id,
                    %status,
                    error = format!("{e:#}"),
                    "status report not sent"
                );
            }
            processed += 1;
        }
        processed
    }

    /// One valve pass per configured meter, in order. Telemetry is only
    /// published while the pub/sub link is usable.
    pub(crate) fn monitor(&mut self, publish: bool) {
        for &address in &self.addresses {
            let report = match self.valves.run_pass(address) {
                Ok(r) => r,
                Err(e) => {
                    error!(address, error = format!("{e:#}"), "monitor pass failed");
                    continue;
                }
            };
            if !report.acked {
                warn!(address, state = %report.state, "valve state unconfirmed until next pass");
            }
            if !publish {
                continue;
            }
            let (Some(cumulative), Some(target)) = (report.cumulative, report.target) else {
                continue;
            };
            let telemetry = TelemetryReport::new(address, cumulative, target);
            if let Err(e) = publish_json(self.pubsub.as_ref(), &self.topic, &telemetry) {
                warn!(address, error = format!("{e:#}"), "telemetry not sent");
            }
        }
    }

    fn ping(&self) -> bool {
        self.pubsub.ping()
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub(crate) struct Maintenance {
    pub(crate) window: MaintenanceWindow,
    pub(crate) reconciler: UpdateReconciler,
    pub(crate) restart_after: bool,
}

pub(crate) struct Orchestrator {
    worker: Worker,
    liveness: LivenessWriter,
    modem: Box<dyn Modem>,
    link: LinkSupervisor,
    memory: MemoryGuard,
    maintenance: Option<Maintenance>,
    interval: Duration,
    checkpoint: Duration,
}

impl Orchestrator {
    pub(crate) fn new(
        cfg: &Config,
        worker: Worker,
        liveness: LivenessWriter,
        modem: Box<dyn Modem>,
        booted: Instant,
    ) -> Self {
        Self {
            worker,
            liveness,
            modem,
            link: LinkSupervisor::new(&cfg.link, booted),
            memory: MemoryGuard::new(cfg.monitor.min_free_memory_mib),
            maintenance: None,
            interval: cfg.monitor.interval(),
            checkpoint: cfg.monitor.checkpoint(),
        }
    }

    pub(crate) fn with_maintenance(mut self, maintenance: Maintenance) -> Self {
        self.maintenance = Some(maintenance);
        self
    }

    fn run_maintenance(&mut self) -> Result<ControlFlow<RestartReason>> {
        let Some(m) = &self.maintenance else {
            return Ok(ControlFlow::Continue(()));
        };
        let Some(day) = m.window.due(OffsetDateTime::now_utc()) else {
            return Ok(ControlFlow::Continue(()));
        };
        info!(%day, "maintenance window");
        // Recorded up front so a reset part way through cannot repeat the run.
        m.window.mark_done(day)?;
        let firmware_updated = m.reconciler.reconcile_all(&self.liveness);
        self.liveness.touch();

        if firmware_updated {
            return Ok(ControlFlow::Break(RestartReason::FirmwareUpdated));
        }
        if m.restart_after {
            return Ok(ControlFlow::Break(RestartReason::MaintenanceRestart));
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Everything in one cycle except the sleep.
    pub(crate) fn run_cycle(&mut self) -> Result<ControlFlow<RestartReason>> {
        self.liveness.touch();

        if let Some(available) = self.memory.check() {
            error!(available_bytes = available, "memory low");
            return Ok(ControlFlow::Break(RestartReason::LowMemory));
        }
        if let ControlFlow::Break(reason) = self.run_maintenance()? {
            return Ok(ControlFlow::Break(reason));
        }

        self.worker.drain_commands();

        let status = self
            .link
            .observe(self.modem.link_is_up(), self.worker.ping(), Instant::now());
        match status {
            LinkStatus::ModemDown => {
                error!("modem link lost");
                return Ok(ControlFlow::Break(RestartReason::ModemDown));
            }
            LinkStatus::PubSubDead { failures } => {
                error!(failures, "pub/sub ping failure threshold reached");
                return Ok(ControlFlow::Break(RestartReason::PubSubDead));
            }
            LinkStatus::Degraded { failures } => {
                warn!(failures, "pub/sub degraded, telemetry skipped this cycle")
            }
            LinkStatus::Healthy => {}
        }

        self.worker.monitor(status.pubsub_usable());
        self.liveness.touch();
        Ok(ControlFlow::Continue(()))
    }

    /// Sleep until the next cycle, keeping liveness fresh and answering
    /// commands as soon as they arrive.
    pub(crate) fn sleep_until_next_cycle(&mut self) {
        let queue = Arc::clone(&self.worker.queue);
        self.liveness
            .sleep_in_checkpoints(self.interval, self.checkpoint, |step| {
                if queue.wait_for_work(step) {
                    self.worker.drain_commands();
                }
            });
    }

    /// Run cycles until one asks for a restart.
    pub(crate) fn run(mut self) -> RestartReason {
        info!(
            devices = self.worker.addresses.len(),
            interval_secs = self.interval.as_secs(),
            "worker started"
        );
        loop {
            match self.run_cycle() {
                Ok(ControlFlow::Continue(())) => self.sleep_until_next_cycle(),
                Ok(ControlFlow::Break(reason)) => return reason,
                Err(e) => return RestartReason::LoopCrash(format!("{e:#}")),
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusTiming, BusTransport, ReadRetry};
    use crate::config::test_config;
    use crate::link::AlwaysUpModem;
    use crate::mqtt::fake::RecordingPubSub;
    use crate::sim::{SimHandle, SimulatedBus};
    use crate::store::DeviceStore;
    use crate::update::fake::FakeSource;
    use crate::watchdog::{LivenessReader, WatchdogState};
    use std::sync::atomic::Ordering;

    struct Rig {
        orch: Orchestrator,
        sim: SimHandle,
        pubsub: Arc<RecordingPubSub>,
        queue: Arc<CommandQueue>,
        liveness: LivenessReader,
        dir: tempfile::TempDir,
    }

    struct DownModem;

    impl Modem for DownModem {
        fn initialize(&mut self) -> Result<()> {
            Ok(())
        }

        fn link_is_up(&mut self) -> bool {
            false
        }
    }

    fn config() -> Config {
        let mut cfg = test_config();
        cfg.monitor.min_free_memory_mib = 0;
        cfg
    }

    fn rig_with(cfg: Config, modem: Box<dyn Modem>) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let (bus, sim) = SimulatedBus::new(&cfg.addresses);
        let valves = ValveController::new(
            BusTransport::new(Box::new(bus), BusTiming::instant()),
            DeviceStore::open(dir.path()).unwrap(),
            ReadRetry {
                attempts: 2,
                delay: Duration::ZERO,
            },
            &cfg.addresses,
        );
        let pubsub = Arc::new(RecordingPubSub::default());
        let queue = Arc::new(CommandQueue::new());
        let worker = Worker::new(&cfg, valves, pubsub.clone(), Arc::clone(&queue));
        let (writer, reader) = WatchdogState::create();
        let orch = Orchestrator::new(&cfg, worker, writer, modem, Instant::now());
        Rig {
            orch,
            sim,
            pubsub,
            queue,
            liveness: reader,
            dir,
        }
    }

    fn rig() -> Rig {
        rig_with(config(), Box::new(AlwaysUpModem))
    }

    fn token(address: u8, litres: i64) -> Command {
        Command {
            kind: CommandKind::TokenLoad { litres },
            address,
            external_id: format!("FQX_SM_10006-{address}"),
        }
    }

    fn valve(address: u8, kind: CommandKind) -> Command {
        Command {
            kind,
            address,
            external_id: format!("FQX_SM_10006-{address}"),
        }
    }

    // -- drain --------------------------------------------------------------

    #[test]
    fn drain_reports_each_command_in_order() {
        let mut r = rig();
        r.sim.set_cumulative(12, 100);
        r.queue.push(token(12, 50));
        r.queue.push(valve(13, CommandKind::ValveOpen));
        r.queue.push(valve(13, CommandKind::ValveClose));

        assert_eq!(r.orch.worker.drain_commands(), 3);
        assert_eq!(
            r.pubsub.statuses(),
            vec!["load_success", "valve_open", "valve_closed"]
        );
        let (topic, first) = &r.pubsub.messages()[0];
        assert_eq!(topic, "smartmeter/FQX_SM_10006/pub/controlcomm/message");
        assert_eq!(first["device"], "FQX_SM_10006-12");
        assert_eq!(first["type"], "device_report");
    }

    #[test]
    fn drain_continues_after_failing_command() {
        let mut r = rig();
        // A directory where device 13's record belongs makes its load fail.
        std::fs::create_dir(r.dir.path().join("targets/target_13.json")).unwrap();
        r.queue.push(token(12, 10));
        r.queue.push(token(13, 10));
        r.queue.push(valve(12, CommandKind::ValveClose));

        r.orch.worker.drain_commands();
        assert_eq!(
            r.pubsub.statuses(),
            vec!["load_success", "load_failure", "valve_closed"]
        );
        assert!(r.queue.is_empty());
        assert_eq!(r.sim.valve_open(12), Some(false));
    }

    #[test]
    fn ignored_token_load_reports_failure() {
        let mut r = rig();
        r.queue.push(token(12, 0));
        r.orch.worker.drain_commands();
        assert_eq!(r.pubsub.statuses(), vec!["load_failure"]);
    }

    #[test]
    fn failed_publish_does_not_stop_drain() {
        let mut r = rig();
        r.pubsub.fail_publish.store(true, Ordering::SeqCst);
        r.queue.push(valve(12, CommandKind::ValveOpen));
        r.queue.push(valve(13, CommandKind::ValveOpen));
        assert_eq!(r.orch.worker.drain_commands(), 2);
        assert_eq!(r.sim.valve_open(13), Some(true));
    }

    // -- cycle --------------------------------------------------------------

    #[test]
    fn cycle_publishes_telemetry_per_device() {
        let mut r = rig();
        r.sim.set_cumulative(12, 40);
        r.sim.set_cumulative(13, 70);
        assert_eq!(r.orch.run_cycle().unwrap(), ControlFlow::Continue(()));

        let msgs = r.pubsub.messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(
            msgs[0].1,
            serde_json::json!({
                "type": "device_report",
                "device": 12,
                "cumulative_flow_L": 40,
                "target_flow": 40
            })
        );
        assert_eq!(msgs[1].1["device"], 13);
        assert!(r.liveness.is_alive(Duration::from_secs(5)));
    }

    #[test]
    fn cycle_drains_commands_before_monitoring() {
        let mut r = rig();
        r.sim.set_cumulative(13, 500);
        r.orch.run_cycle().unwrap();
        r.queue.push(token(13, 200));
        r.orch.run_cycle().unwrap();
        assert_eq!(r.sim.valve_open(13), Some(true));
        assert!(r.pubsub.statuses().contains(&"load_success".to_string()));
    }

    #[test]
    fn degraded_link_still_enforces_valves() {
        let mut r = rig();
        r.pubsub.unhealthy.store(true, Ordering::SeqCst);
        r.sim.set_cumulative(12, 5);
        assert_eq!(r.orch.run_cycle().unwrap(), ControlFlow::Continue(()));
        assert!(r.pubsub.messages().is_empty());
        assert_eq!(r.sim.meter(12).unwrap().valve_writes, 1);
        assert_eq!(r.sim.meter(13).unwrap().valve_writes, 1);
    }

    #[test]
    fn modem_down_requests_restart() {
        let mut r = rig_with(config(), Box::new(DownModem));
        assert_eq!(
            r.orch.run_cycle().unwrap(),
            ControlFlow::Break(RestartReason::ModemDown)
        );
    }

    #[test]
    fn dead_pubsub_requests_restart() {
        let mut cfg = config();
        cfg.link.boot_grace_secs = 0;
        cfg.link.ping_failure_threshold = 2;
        let mut r = rig_with(cfg, Box::new(AlwaysUpModem));
        r.pubsub.unhealthy.store(true, Ordering::SeqCst);
        assert_eq!(r.orch.run_cycle().unwrap(), ControlFlow::Continue(()));
        assert_eq!(
            r.orch.run_cycle().unwrap(),
            ControlFlow::Break(RestartReason::PubSubDead)
        );
    }

    #[test]
    fn maintenance_runs_once_and_restarts() {
        let mut r = rig();
        let now = OffsetDateTime::now_utc();
        let state_dir = r.dir.path().join("state");
        let source = FakeSource::default();
        let mut update = config().update;
        update.fetch_retries = 1;
        let reconciler = UpdateReconciler::new(
            Box::new(source),
            &update,
            "FQX_SM_10006",
            &state_dir,
            &r.dir.path().join("config.toml"),
        );
        let window = MaintenanceWindow::new(now.hour(), 0, &state_dir).unwrap();
        r.orch = r.orch.with_maintenance(Maintenance {
            window,
            reconciler,
            restart_after: true,
        });

        // Guard against the hour rolling over between `now` and the cycle.
        if OffsetDateTime::now_utc().hour() != now.hour() {
            return;
        }
        assert_eq!(
            r.orch.run_cycle().unwrap(),
            ControlFlow::Break(RestartReason::MaintenanceRestart)
        );
        if OffsetDateTime::now_utc().date() == now.date() {
            assert_eq!(r.orch.run_cycle().unwrap(), ControlFlow::Continue(()));
        }
    }

    /// Advertises a new release whose files all fail after a delay, noting
    /// how stale liveness was and whether the maintenance day was recorded.
    struct SlowSource {
        delay: Duration,
        liveness: LivenessReader,
        marker: std::path::PathBuf,
        seen: Arc<std::sync::Mutex<Vec<(Duration, bool)>>>,
    }

    impl crate::update::RemoteSource for SlowSource {
        fn fetch(&self, path: &str) -> Result<crate::update::Fetched> {
            let stale = self.liveness.since_alive();
            self.seen.lock().unwrap().push((stale, self.marker.exists()));
            std::thread::sleep(self.delay);
            if path == "version.txt" {
                return Ok(crate::update::Fetched {
                    body: b"9.9.9".to_vec(),
                    expected_len: None,
                });
            }
            anyhow::bail!("timed out fetching {path}")
        }
    }

    #[test]
    fn slow_maintenance_keeps_worker_alive() {
        let mut r = rig();
        let now = OffsetDateTime::now_utc();
        let state_dir = r.dir.path().join("state");
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let source = SlowSource {
            delay: Duration::from_millis(40),
            liveness: r.liveness.clone(),
            marker: state_dir.join("last_maintenance"),
            seen: Arc::clone(&seen),
        };
        let mut update = config().update;
        update.fetch_retries = 2;
        update.fetch_retry_delay_secs = 0;
        update.firmware_dir = r.dir.path().join("fw");
        update.files = (1..=8).map(|i| format!("part{i}.bin")).collect();
        let reconciler = UpdateReconciler::new(
            Box::new(source),
            &update,
            "FQX_SM_10006",
            &state_dir,
            &r.dir.path().join("config.toml"),
        );
        let window = MaintenanceWindow::new(now.hour(), 0, &state_dir).unwrap();
        r.orch = r.orch.with_maintenance(Maintenance {
            window,
            reconciler,
            restart_after: false,
        });

        if OffsetDateTime::now_utc().hour() != now.hour() {
            return;
        }
        r.orch.run_cycle().unwrap();

        let seen = seen.lock().unwrap();
        // Config twice, version once, each of the eight files twice.
        assert_eq!(seen.len(), 19);
        for &(stale, marked) in seen.iter() {
            assert!(stale < Duration::from_millis(30), "liveness stale for {stale:?}");
            assert!(marked, "maintenance day not recorded before fetching");
        }
    }

    // -- sleep --------------------------------------------------------------

    #[test]
    fn commands_answered_during_sleep() {
        let mut r = rig();
        r.orch.interval = Duration::from_millis(300);
        r.orch.checkpoint = Duration::from_millis(100);
        let queue = Arc::clone(&r.queue);
        let producer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            queue.push(valve(12, CommandKind::ValveOpen));
        });
        r.orch.sleep_until_next_cycle();
        producer.join().unwrap();
        assert_eq!(r.pubsub.statuses(), vec!["valve_open"]);
        assert!(r.liveness.is_alive(Duration::from_secs(1)));
    }
}
