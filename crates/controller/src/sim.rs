//! In-memory meter fleet speaking the same Modbus RTU frames as the real
//! meters. Backs `bus.backend = "sim"` for bench runs without hardware and is
//! the bus double for the unit tests.
//!
//! In tests the port and a `SimHandle` share one fleet; the handle changes
//! readings and injects faults while the transport owns the port.

use anyhow::Result;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::bus::BusPort;
use crate::modbus;

/// Bench fleet: litres added to an open meter every time its volume is read.
const BENCH_FLOW_PER_READ: u16 = 5;

// ---------------------------------------------------------------------------
// Fleet state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub(crate) struct SimMeter {
    pub(crate) cumulative: u16,
    pub(crate) flow_rate: u16,
    pub(crate) cell_voltage_bcd: u16,
    pub(crate) valve_open: bool,
    #[cfg(test)]
    pub(crate) valve_writes: u32,
}

#[derive(Debug, Default)]
struct Fleet {
    meters: BTreeMap<u8, SimMeter>,
    rx: VecDeque<u8>,
    /// Remaining requests per address that get no answer.
    silent: BTreeMap<u8, u32>,
    /// Remaining responses (any address) sent with a broken CRC.
    corrupt: u32,
    /// Whether open valves advance the volume on every read.
    flowing: bool,
    #[cfg(test)]
    requests: u32,
}

impl Fleet {
    fn handle_request(&mut self, frame: &[u8]) {
        #[cfg(test)]
        {
            self.requests += 1;
        }
        if frame.len() < 8 || !modbus::verify_crc(frame) {
            return;
        }
        let address = frame[0];
        if let Some(left) = self.silent.get_mut(&address) {
            if *left > 0 {
                *left -= 1;
                return;
            }
        }
        let flowing = self.flowing;
        let Some(meter) = self.meters.get_mut(&address) else {
            return;
        };

        let register = u16::from_be_bytes([frame[2], frame[3]]);
        let mut response = match frame[1] {
            modbus::FN_READ_HOLDING => {
                let count = u16::from_be_bytes([frame[4], frame[5]]) as usize;
                let block: Vec<u16> = match register {
                    modbus::REG_CUMULATIVE => {
                        let value = meter.cumulative;
                        if flowing && meter.valve_open {
                            meter.cumulative = meter.cumulative.saturating_add(meter.flow_rate);
                        }
                        vec![value, 0]
                    }
                    modbus::REG_FLOW_RATE => {
                        let rate = if meter.valve_open { meter.flow_rate } else { 0 };
                        vec![rate, 0]
                    }
                    modbus::REG_CELL_VOLTAGE => vec![meter.cell_voltage_bcd],
                    _ => Vec::new(),
                };
                let registers: Vec<u16> = (0..count)
                    .map(|i| block.get(i).copied().unwrap_or(0))
                    .collect();
                modbus::build_read_response(address, &registers)
            }
            modbus::FN_WRITE_MULTIPLE if frame.len() == 11 => {
                if register == modbus::REG_VALVE {
                    match u16::from_be_bytes([frame[7], frame[8]]) {
                        modbus::VALVE_OPEN => meter.valve_open = true,
                        modbus::VALVE_CLOSE => meter.valve_open = false,
                        _ => return,
                    }
                    #[cfg(test)]
                    {
                        meter.valve_writes += 1;
                    }
                }
                modbus::build_write_ack(address, register).to_vec()
            }
            _ => return,
        };

        if self.corrupt > 0 {
            self.corrupt -= 1;
            if let Some(last) = response.last_mut() {
                *last ^= 0xFF;
            }
        }
        self.rx.extend(response);
    }
}

fn lock(fleet: &Mutex<Fleet>) -> MutexGuard<'_, Fleet> {
    fleet.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

pub(crate) struct SimulatedBus {
    fleet: Arc<Mutex<Fleet>>,
}

impl SimulatedBus {
    /// All meters at zero with valves closed.
    fn quiet(addresses: &[u8]) -> Self {
        let fleet = Fleet {
            meters: addresses
                .iter()
                .map(|&a| (a, SimMeter::default()))
                .collect(),
            ..Fleet::default()
        };
        Self {
            fleet: Arc::new(Mutex::new(fleet)),
        }
    }

    /// A bench fleet: staggered starting volumes, a healthy cell, and water
    /// flowing through every open valve.
    pub(crate) fn bench(addresses: &[u8]) -> Self {
        let bus = Self::quiet(addresses);
        {
            let mut fleet = lock(&bus.fleet);
            fleet.flowing = true;
            for (&address, meter) in fleet.meters.iter_mut() {
                meter.cumulative = 1000 + address as u16 * 50;
                meter.flow_rate = BENCH_FLOW_PER_READ;
                meter.cell_voltage_bcd = 0x0370;
            }
        }
        bus
    }

    /// A quiet fleet whose volume only changes through the returned handle.
    #[cfg(test)]
    pub(crate) fn new(addresses: &[u8]) -> (Self, SimHandle) {
        let bus = Self::quiet(addresses);
        let handle = bus.handle();
        (bus, handle)
    }

    #[cfg(test)]
    pub(crate) fn handle(&self) -> SimHandle {
        SimHandle(Arc::clone(&self.fleet))
    }
}

impl BusPort for SimulatedBus {
    fn write_all(&mut self, frame: &[u8]) -> Result<()> {
        lock(&self.fleet).handle_request(frame);
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize> {
        Ok(lock(&self.fleet).rx.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut fleet = lock(&self.fleet);
        let n = buf.len().min(fleet.rx.len());
        for (slot, byte) in buf.iter_mut().zip(fleet.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[cfg(test)]
#[derive(Clone)]
pub(crate) struct SimHandle(Arc<Mutex<Fleet>>);

#[cfg(test)]
impl SimHandle {
    pub(crate) fn set_cumulative(&self, address: u8, litres: u16) {
        if let Some(m) = lock(&self.0).meters.get_mut(&address) {
            m.cumulative = litres;
        }
    }

    pub(crate) fn set_flow_rate(&self, address: u8, rate: u16) {
        if let Some(m) = lock(&self.0).meters.get_mut(&address) {
            m.flow_rate = rate;
            // Flow only shows while the valve is open.
            m.valve_open = true;
        }
    }

    pub(crate) fn set_cell_voltage_bcd(&self, address: u8, raw: u16) {
        if let Some(m) = lock(&self.0).meters.get_mut(&address) {
            m.cell_voltage_bcd = raw;
        }
    }

    /// Drop the next `requests` requests addressed to `address`.
    pub(crate) fn silence(&self, address: u8, requests: u32) {
        lock(&self.0).silent.insert(address, requests);
    }

    /// Break the CRC of the next `responses` responses.
    pub(crate) fn corrupt_next(&self, responses: u32) {
        lock(&self.0).corrupt = responses;
    }

    /// Leave junk in the receive buffer, as a half-received frame would.
    pub(crate) fn inject_stale(&self, bytes: &[u8]) {
        lock(&self.0).rx.extend(bytes.iter().copied());
    }

    pub(crate) fn valve_open(&self, address: u8) -> Option<bool> {
        lock(&self.0).meters.get(&address).map(|m| m.valve_open)
    }

    pub(crate) fn meter(&self, address: u8) -> Option<SimMeter> {
        lock(&self.0).meters.get(&address).cloned()
    }

    /// Frames written to the bus so far.
    pub(crate) fn requests(&self) -> u32 {
        lock(&self.0).requests
    }
}

// ===========================================================================
// Tests
// ===========================================================================
