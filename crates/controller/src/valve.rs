//! Prepaid valve policy. Each monitoring pass reads a meter's cumulative
//! volume, compares it with the stored prepaid target and commands the valve:
//! open while volume is below target, closed otherwise. Anything uncertain
//! (failed read, unreadable target) closes the valve.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use crate::bus::{BusTransport, ReadRetry};
use crate::store::DeviceStore;

/// Pause between opening and closing every valve during the boot self-test.
const SELF_TEST_HOLD: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValveState {
    Unknown,
    Open,
    Closed,
}

impl fmt::Display for ValveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// What one monitoring pass saw and did for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PassReport {
    /// `None` when the meter did not answer.
    pub(crate) cumulative: Option<u32>,
    pub(crate) target: Option<u32>,
    pub(crate) state: ValveState,
    /// Whether the meter acknowledged the valve command.
    pub(crate) acked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TokenLoadOutcome {
    /// Zero or negative litres; nothing changed.
    Ignored,
    Applied { new_target: u32, pass: PassReport },
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub(crate) struct ValveController {
    bus: BusTransport,
    store: DeviceStore,
    retry: ReadRetry,
    states: BTreeMap<u8, ValveState>,
    self_test_hold: Duration,
}

impl ValveController {
    pub(crate) fn new(
        bus: BusTransport,
        store: DeviceStore,
        retry: ReadRetry,
        addresses: &[u8],
    ) -> Self {
        Self {
            bus,
            store,
            retry,
            states: addresses.iter().map(|&a| (a, ValveState::Unknown)).collect(),
            self_test_hold: SELF_TEST_HOLD,
        }
    }

    /// Last commanded state, `Unknown` before the first pass.
    pub(crate) fn state(&self, address: u8) -> ValveState {
        self.states
            .get(&address)
            .copied()
            .unwrap_or(ValveState::Unknown)
    }

    fn command(&mut self, address: u8, state: ValveState) -> bool {
        let acked = self.bus.set_valve(address, state == ValveState::Open);
        if !acked {
            warn!(address, %state, "valve command not acknowledged");
        }
        self.states.insert(address, state);
        acked
    }

    pub(crate) fn open(&mut self, address: u8) -> bool {
        self.command(address, ValveState::Open)
    }

    pub(crate) fn close(&mut self, address: u8) -> bool {
        self.command(address, ValveState::Closed)
    }

    /// Run the prepaid policy for one device. The valve command is sent on
    /// every pass, not only when the state changes.
    pub(crate) fn run_pass(&mut self, address: u8) -> Result<PassReport> {
        let cumulative = self.bus.read_cumulative(address, self.retry);

        let stored = match self.store.load(address) {
            Ok(t) => t,
            Err(e) => {
                let acked = self.close(address);
                warn!(address, acked, "target unreadable, valve closed");
                return Err(e);
            }
        };

        let Some(cumulative) = cumulative else {
            let acked = self.close(address);
            warn!(address, acked, "meter read failed, valve closed (fail-safe)");
            return Ok(PassReport {
                cumulative: None,
                target: stored,
                state: ValveState::Closed,
                acked,
            });
        };

        let target = match stored {
            Some(t) => t,
            None => {
                // First sighting: the device starts with nothing prepaid.
                if let Err(e) = self.store.save(address, cumulative) {
                    self.close(address);
                    return Err(e).context("failed to seed initial target");
                }
                info!(address, target = cumulative, "initial target seeded from meter");
                cumulative
            }
        };

        let state = if cumulative >= target {
            ValveState::Closed
        } else {
            ValveState::Open
        };
        let acked = self.command(address, state);
        info!(address, cumulative, target, %state, "monitor pass");

        Ok(PassReport {
            cumulative: Some(cumulative),
            target: Some(target),
            state,
            acked,
        })
    }

    /// Credit `litres` to a device's prepaid target and re-run its pass right
    /// away so the valve reacts without waiting for the next cycle.
    pub(crate) fn apply_token_load(
        &mut self,
        address: u8,
        litres: i64,
    ) -> Result<TokenLoadOutcome> {
        if litres <= 0 {
            info!(address, litres, "token load ignored: no litres to add");
            return Ok(TokenLoadOutcome::Ignored);
        }
        let litres = u32::try_from(litres)
            .with_context(|| format!("token load of {litres} L out of range"))?;

        let current = self.store.load(address)?.unwrap_or(0);
        let Some(new_target) = current.checked_add(litres) else {
            bail!("token load overflows target for device {address} ({current} + {litres})");
        };
        self.store.save(address, new_target)?;
        info!(address, litres, from = current, to = new_target, "token loaded");

        let pass = self.run_pass(address)?;
        Ok(TokenLoadOutcome::Applied { new_target, pass })
    }

    /// Give a device a starting target if it has none.
    pub(crate) fn seed_default_target(&mut self, address: u8, default: u32) -> Result<u32> {
        if let Some(t) = self.store.load(address)? {
            return Ok(t);
        }
        self.store.save(address, default)?;
        info!(address, target = default, "default target seeded");
        Ok(default)
    }

    /// Boot self-test: cycle every valve, then log each meter's readings.
    pub(crate) fn self_test(&mut self, addresses: &[u8]) {
        for &a in addresses {
            self.open(a);
        }
        thread::sleep(self.self_test_hold);
        for &a in addresses {
            self.close(a);
        }

        for &a in addresses {
            let cumulative = self.bus.read_cumulative(a, self.retry);
            let flow = self.bus.read_flow_rate(a);
            let voltage = self.bus.read_cell_voltage(a);
            match cumulative {
                Some(c) => info!(
                    address = a,
                    cumulative_l = c,
                    flow = ?flow,
                    cell_v = ?voltage,
                    "self-test readings"
                ),
                None => warn!(address = a, "self-test: meter not responding"),
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
