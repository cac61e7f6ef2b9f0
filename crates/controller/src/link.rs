//! Cellular modem status and pub/sub link health.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::{LinkConfig, ModemConfig};

const MODEM_POLL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Modem seam
// ---------------------------------------------------------------------------

pub(crate) trait Modem: Send {
    /// Bring the modem up. Called once at boot.
    fn initialize(&mut self) -> Result<()>;

    fn link_is_up(&mut self) -> bool;
}

/// Reads the kernel's view of the modem's network interface.
pub(crate) struct InterfaceModem {
    operstate: PathBuf,
}

impl InterfaceModem {
    pub(crate) fn new(interface: &str) -> Self {
        Self {
            operstate: PathBuf::from(format!("/sys/class/net/{interface}/operstate")),
        }
    }
}

impl Modem for InterfaceModem {
    fn initialize(&mut self) -> Result<()> {
        // The modem manager owns dial-up; only check the interface exists.
        fs::metadata(&self.operstate)
            .with_context(|| format!("modem interface missing ({})", self.operstate.display()))?;
        Ok(())
    }

    fn link_is_up(&mut self) -> bool {
        match fs::read_to_string(&self.operstate) {
            // Point-to-point interfaces often report "unknown" while passing traffic.
            Ok(s) => matches!(s.trim(), "up" | "unknown"),
            Err(_) => false,
        }
    }
}

/// Used when no modem interface is configured (wired bench setups).
pub(crate) struct AlwaysUpModem;

impl Modem for AlwaysUpModem {
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn link_is_up(&mut self) -> bool {
        true
    }
}

pub(crate) fn open_modem(cfg: &ModemConfig) -> Box<dyn Modem> {
    match &cfg.interface {
        Some(iface) => Box::new(InterfaceModem::new(iface)),
        None => {
            info!("no modem interface configured, assuming link is up");
            Box::new(AlwaysUpModem)
        }
    }
}

/// Initialise the modem and wait for its link, polling once per `poll` for up
/// to `timeout`. Returns whether the link came up.
pub(crate) fn wait_for_modem(modem: &mut dyn Modem, timeout: Duration, poll: Duration) -> bool {
    if let Err(e) = modem.initialize() {
        warn!(error = format!("{e:#}"), "modem initialisation failed");
        return false;
    }
    let deadline = Instant::now() + timeout;
    loop {
        if modem.link_is_up() {
            info!("modem link up");
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(poll);
    }
}

pub(crate) fn wait_for_modem_cfg(modem: &mut dyn Modem, cfg: &ModemConfig) -> bool {
    wait_for_modem(modem, Duration::from_secs(cfg.init_timeout_secs), MODEM_POLL)
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkStatus {
    Healthy,
    /// Ping failed but the threshold has not been reached (or still in grace).
    Degraded { failures: u32 },
    ModemDown,
    PubSubDead { failures: u32 },
}

impl LinkStatus {
    pub(crate) fn pubsub_usable(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

pub(crate) struct LinkSupervisor {
    threshold: u32,
    grace_until: Instant,
    failures: u32,
}

impl LinkSupervisor {
    pub(crate) fn new(cfg: &LinkConfig, booted: Instant) -> Self {
        Self {
            threshold: cfg.ping_failure_threshold,
            grace_until: booted + cfg.boot_grace(),
            failures: 0,
        }
    }

    /// Fold one link check into the supervisor. Modem down is fatal at once;
    /// ping failures are counted outside the boot grace window and become
    /// fatal once they reach the threshold.
    pub(crate) fn observe(&mut self, modem_up: bool, ping_ok: bool, now: Instant) -> LinkStatus {
        if !modem_up {
            return LinkStatus::ModemDown;
        }
        if ping_ok {
            if self.failures > 0 {
                info!(after = self.failures, "pub/sub ping recovered");
            }
            self.failures = 0;
            return LinkStatus::Healthy;
        }
        if now < self.grace_until {
            return LinkStatus::Degraded {
                failures: self.failures,
            };
        }
        self.failures += 1;
        warn!(failures = self.failures, threshold = self.threshold, "pub/sub ping failed");
        if self.failures >= self.threshold {
            LinkStatus::PubSubDead {
                failures: self.failures,
            }
        } else {
            LinkStatus::Degraded {
                failures: self.failures,
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
