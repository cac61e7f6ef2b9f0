//! Hang detection. The worker stamps a liveness tick; a separate thread keeps
//! the hardware watchdog fed only while that tick is recent, so a stuck worker
//! ends in a board reset.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::WatchdogConfig;

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Liveness {
    epoch: Instant,
    last_alive_ms: AtomicU64,
}

impl Liveness {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// Shared liveness tick. Split into exactly one writer and any number of
/// readers.
pub(crate) struct WatchdogState;

impl WatchdogState {
    pub(crate) fn create() -> (LivenessWriter, LivenessReader) {
        let inner = Arc::new(Liveness {
            epoch: Instant::now(),
            last_alive_ms: AtomicU64::new(0),
        });
        (LivenessWriter(Arc::clone(&inner)), LivenessReader(inner))
    }
}

/// Held by the worker. Not `Clone`.
#[derive(Debug)]
pub(crate) struct LivenessWriter(Arc<Liveness>);

impl LivenessWriter {
    pub(crate) fn touch(&self) {
        self.0
            .last_alive_ms
            .store(self.0.now_ms(), Ordering::SeqCst);
    }

    /// Wait out `total` in chunks of at most `step`, touching liveness before
    /// each chunk. `wait` does the actual waiting and may return early; the
    /// remaining time is still honoured.
    pub(crate) fn sleep_in_checkpoints(
        &self,
        total: Duration,
        step: Duration,
        mut wait: impl FnMut(Duration),
    ) {
        let deadline = Instant::now() + total;
        loop {
            self.touch();
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            wait(remaining.min(step));
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct LivenessReader(Arc<Liveness>);

impl LivenessReader {
    pub(crate) fn since_alive(&self) -> Duration {
        let last = self.0.last_alive_ms.load(Ordering::SeqCst);
        Duration::from_millis(self.0.now_ms().saturating_sub(last))
    }

    pub(crate) fn is_alive(&self, hang_timeout: Duration) -> bool {
        self.since_alive() < hang_timeout
    }
}

// ---------------------------------------------------------------------------
// Hardware seam
// ---------------------------------------------------------------------------

pub(crate) trait HardwareWatchdog: Send {
    fn feed(&mut self) -> Result<()>;
}

/// Kernel watchdog device, e.g. `/dev/watchdog`. Any write resets its timer.
pub(crate) struct DevWatchdog {
    file: File,
}

impl DevWatchdog {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open watchdog {}", path.display()))?;
        info!(device = %path.display(), "hardware watchdog armed");
        Ok(Self { file })
    }
}

impl HardwareWatchdog for DevWatchdog {
    fn feed(&mut self) -> Result<()> {
        self.file.write_all(b"\0")?;
        self.file.flush()?;
        Ok(())
    }
}

/// Development stand-in when no device is configured.
pub(crate) struct NullWatchdog;

impl HardwareWatchdog for NullWatchdog {
    fn feed(&mut self) -> Result<()> {
        debug!("watchdog fed (no device)");
        Ok(())
    }
}

pub(crate) fn open_watchdog(cfg: &WatchdogConfig) -> Result<Box<dyn HardwareWatchdog>> {
    match &cfg.device {
        Some(path) => Ok(Box::new(DevWatchdog::open(path)?)),
        None => {
            warn!("no watchdog device configured, hangs will not reset the board");
            Ok(Box::new(NullWatchdog))
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tick {
    Fed,
    Starved { silent_for: Duration },
}

pub(crate) struct WatchdogSupervisor {
    hw: Box<dyn HardwareWatchdog>,
    liveness: LivenessReader,
    hang_timeout: Duration,
    feed_interval: Duration,
    starving: bool,
}

impl WatchdogSupervisor {
    pub(crate) fn new(
        hw: Box<dyn HardwareWatchdog>,
        liveness: LivenessReader,
        cfg: &WatchdogConfig,
    ) -> Self {
        Self {
            hw,
            liveness,
            hang_timeout: cfg.hang_timeout(),
            feed_interval: cfg.feed_interval(),
            starving: false,
        }
    }

    pub(crate) fn tick(&mut self) -> Tick {
        if self.liveness.is_alive(self.hang_timeout) {
            if self.starving {
                warn!("worker alive again, resuming watchdog feed");
                self.starving = false;
            }
            if let Err(e) = self.hw.feed() {
                warn!(error = format!("{e:#}"), "watchdog feed failed");
            }
            return Tick::Fed;
        }

        let silent_for = self.liveness.since_alive();
        if !self.starving {
            error!(
                silent_secs = silent_for.as_secs(),
                "worker hung, no longer feeding watchdog"
            );
            self.starving = true;
        }
        Tick::Starved { silent_for }
    }

    pub(crate) fn run(mut self) -> ! {
        info!(
            feed_every_secs = self.feed_interval.as_secs(),
            hang_timeout_secs = self.hang_timeout.as_secs(),
            "watchdog supervisor started"
        );
        loop {
            if let Tick::Starved { silent_for } = self.tick() {
                debug!(silent_secs = silent_for.as_secs(), "watchdog starving");
            }
            thread::sleep(self.feed_interval);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
