//! Process lifecycle: the single restart exit, the memory floor and the daily
//! maintenance window. The service manager restarts the process after every
//! exit, so "restart" here means "log, pause, exit".

use anyhow::{Context, Result};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use sysinfo::System;
use time::{Date, OffsetDateTime, UtcOffset};
use tracing::{error, info};

/// Exit status for a deliberate restart (EX_TEMPFAIL).
pub(crate) const RESTART_EXIT_CODE: i32 = 75;

const MARKER_FILE: &str = "last_maintenance";

const MIB: u64 = 1024 * 1024;

// ---------------------------------------------------------------------------
// Restart
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RestartReason {
    ModemDown,
    ModemInitTimeout,
    PubSubDead,
    LowMemory,
    LoopCrash(String),
    WorkerPanicked,
    FirmwareUpdated,
    MaintenanceRestart,
    ConfigInvalid,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ModemDown => write!(f, "modem link down"),
            Self::ModemInitTimeout => write!(f, "modem did not come up at boot"),
            Self::PubSubDead => write!(f, "pub/sub link unresponsive"),
            Self::LowMemory => write!(f, "available memory below floor"),
            Self::LoopCrash(e) => write!(f, "main loop crashed: {e}"),
            Self::WorkerPanicked => write!(f, "worker thread panicked"),
            Self::FirmwareUpdated => write!(f, "firmware updated"),
            Self::MaintenanceRestart => write!(f, "scheduled maintenance restart"),
            Self::ConfigInvalid => write!(f, "config invalid"),
        }
    }
}

impl RestartReason {
    /// Pause before exiting.
    pub(crate) fn delay(&self) -> Duration {
        match self {
            Self::LoopCrash(_) => Duration::from_secs(5),
            Self::ModemDown => Duration::from_secs(3),
            _ => Duration::from_secs(2),
        }
    }
}

/// Log `reason`, wait its delay and exit for the service manager to restart
/// the process. Every restart goes through here.
pub(crate) fn fatal(reason: RestartReason) -> ! {
    error!(%reason, delay_secs = reason.delay().as_secs(), "restarting");
    thread::sleep(reason.delay());
    std::process::exit(RESTART_EXIT_CODE)
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

pub(crate) struct MemoryGuard {
    floor_bytes: u64,
    sys: System,
}

impl MemoryGuard {
    pub(crate) fn new(min_free_mib: u64) -> Self {
        Self {
            floor_bytes: min_free_mib * MIB,
            sys: System::new(),
        }
    }

    pub(crate) fn is_low(floor_bytes: u64, available: u64) -> bool {
        floor_bytes > 0 && available < floor_bytes
    }

    /// Available bytes, if they are below the floor.
    pub(crate) fn check(&mut self) -> Option<u64> {
        if self.floor_bytes == 0 {
            return None;
        }
        self.sys.refresh_memory();
        let available = self.sys.available_memory();
        Self::is_low(self.floor_bytes, available).then_some(available)
    }
}

// ---------------------------------------------------------------------------
// Maintenance window
// ---------------------------------------------------------------------------

/// Once a local calendar day, during one configured hour.
pub(crate) struct MaintenanceWindow {
    hour: u8,
    offset: UtcOffset,
    marker: PathBuf,
}

impl MaintenanceWindow {
    pub(crate) fn new(hour: u8, utc_offset_hours: i8, state_dir: &Path) -> Result<Self> {
        let offset = UtcOffset::from_hms(utc_offset_hours, 0, 0)
            .with_context(|| format!("invalid utc offset {utc_offset_hours}h"))?;
        Ok(Self {
            hour,
            offset,
            marker: state_dir.join(MARKER_FILE),
        })
    }

    fn last_run(&self) -> Option<String> {
        match fs::read_to_string(&self.marker) {
            Ok(s) => Some(s.trim().to_string()),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                error!(error = %e, "cannot read maintenance marker");
                None
            }
        }
    }

    /// The local date to run maintenance for, if `now` falls in the window and
    /// it has not run yet that day.
    pub(crate) fn due(&self, now: OffsetDateTime) -> Option<Date> {
        let local = now.to_offset(self.offset);
        if local.hour() != self.hour {
            return None;
        }
        let today = local.date();
        if self.last_run().as_deref() == Some(today.to_string().as_str()) {
            return None;
        }
        Some(today)
    }

    pub(crate) fn mark_done(&self, day: Date) -> Result<()> {
        if let Some(dir) = self.marker.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.marker, day.to_string())
            .with_context(|| format!("failed to write {}", self.marker.display()))?;
        info!(%day, "maintenance recorded");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
