//! Field-bus transport: one request/response exchange at a time over a
//! `BusPort`, with stale-byte draining, a bounded response poll and a
//! fixed-delay retry wrapper. The `hw` feature gates the real rppal UART;
//! without it only the simulated meter fleet is available.
//!
//! All failures on this layer are transient: they surface as `None`/`false`
//! and are logged, never returned as errors.

use anyhow::Result;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{BusBackend, BusConfig};
use crate::modbus::{self, FN_READ_HOLDING};
use crate::sim::SimulatedBus;

#[cfg(feature = "hw")]
use anyhow::Context;
#[cfg(feature = "hw")]
use rppal::uart::{Parity, Uart};

/// Upper bound on read rounds while draining leftovers from an earlier,
/// half-received frame.
const DRAIN_MAX_ROUNDS: usize = 32;

/// At most this many short reads are stitched together into one response.
const MAX_READ_CHUNKS: usize = 8;

// ---------------------------------------------------------------------------
// Port seam
// ---------------------------------------------------------------------------

/// Raw byte access to the shared serial bus. Implementations are owned by
/// exactly one `BusTransport`.
pub(crate) trait BusPort: Send {
    fn write_all(&mut self, frame: &[u8]) -> Result<()>;
    /// Bytes currently waiting in the receive buffer.
    fn bytes_available(&mut self) -> Result<usize>;
    /// Non-blocking read of whatever is pending, up to `buf.len()`.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Open the port selected by the config.
pub(crate) fn open_port(cfg: &BusConfig, addresses: &[u8]) -> Result<Box<dyn BusPort>> {
    match cfg.backend {
        BusBackend::Sim => {
            let bus = SimulatedBus::bench(addresses);
            warn!(devices = addresses.len(), "bus: using simulated meter fleet");
            Ok(Box::new(bus))
        }
        #[cfg(feature = "hw")]
        BusBackend::Serial => Ok(Box::new(SerialPort::open(cfg)?)),
        #[cfg(not(feature = "hw"))]
        BusBackend::Serial => {
            anyhow::bail!("bus.backend = \"serial\" requires building with the `hw` feature")
        }
    }
}

// ---------------------------------------------------------------------------
// Real UART (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "hw")]
pub(crate) struct SerialPort {
    uart: Uart,
}

#[cfg(feature = "hw")]
impl SerialPort {
    pub(crate) fn open(cfg: &BusConfig) -> Result<Self> {
        use crate::config::BusParity;

        let parity = match cfg.parity {
            BusParity::None => Parity::None,
            BusParity::Even => Parity::Even,
            BusParity::Odd => Parity::Odd,
        };
        let mut uart = Uart::with_path(&cfg.path, cfg.baud_rate, parity, 8, 1)
            .with_context(|| format!("failed to open uart {}", cfg.path))?;
        // Reads return immediately with whatever is buffered; the transport
        // does its own bounded polling.
        uart.set_read_mode(0, Duration::ZERO)?;
        uart.set_write_mode(true)?;

        tracing::info!(
            path = %cfg.path,
            baud = cfg.baud_rate,
            parity = ?cfg.parity,
            "uart opened"
        );
        Ok(Self { uart })
    }
}

#[cfg(feature = "hw")]
impl BusPort for SerialPort {
    fn write_all(&mut self, frame: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < frame.len() {
            written += self.uart.write(&frame[written..])?;
        }
        self.uart.drain()?;
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize> {
        Ok(self.uart.input_len()?)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.uart.read(buf)?)
    }
}

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) struct BusTiming {
    pub(crate) poll_attempts: u32,
    pub(crate) poll_interval: Duration,
    /// Pause between drain rounds.
    pub(crate) drain_pause: Duration,
    /// Silence kept on the line after draining, before the next request.
    pub(crate) settle: Duration,
    /// Pause after a valve command so the actuator can move.
    pub(crate) valve_settle: Duration,
}

impl BusTiming {
    pub(crate) fn from_config(cfg: &BusConfig) -> Self {
        Self {
            poll_attempts: cfg.poll_attempts,
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            drain_pause: Duration::from_millis(10),
            settle: Duration::from_millis(50),
            valve_settle: Duration::from_millis(cfg.valve_settle_ms),
        }
    }

    /// No sleeping at all; for the simulated bus in tests.
    #[cfg(test)]
    pub(crate) fn instant() -> Self {
        Self {
            poll_attempts: 3,
            poll_interval: Duration::ZERO,
            drain_pause: Duration::ZERO,
            settle: Duration::ZERO,
            valve_settle: Duration::ZERO,
        }
    }
}

/// Fixed-delay retry budget for higher-level reads.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadRetry {
    pub(crate) attempts: u32,
    pub(crate) delay: Duration,
}

impl ReadRetry {
    pub(crate) fn from_config(cfg: &BusConfig) -> Self {
        Self {
            attempts: cfg.read_retries,
            delay: Duration::from_millis(cfg.read_retry_delay_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Exclusive owner of the field bus. Not `Clone`: whoever holds the transport
/// is the only party that can put frames on the wire.
pub(crate) struct BusTransport {
    port: Box<dyn BusPort>,
    timing: BusTiming,
}

impl BusTransport {
    pub(crate) fn new(port: Box<dyn BusPort>, timing: BusTiming) -> Self {
        Self { port, timing }
    }

    /// Discard bytes left over from a previous failed exchange. Bounded: a
    /// babbling slave cannot keep us here forever.
    fn drain_stale(&mut self) -> usize {
        let mut discarded = 0;
        let mut buf = [0u8; 64];
        for _ in 0..DRAIN_MAX_ROUNDS {
            match self.port.bytes_available() {
                Ok(0) => break,
                Ok(_) => match self.port.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => discarded += n,
                    Err(e) => {
                        warn!("bus: drain read failed: {e:#}");
                        break;
                    }
                },
                Err(e) => {
                    warn!("bus: drain poll failed: {e:#}");
                    break;
                }
            }
            sleep(self.timing.drain_pause);
        }
        if discarded > 0 {
            debug!(bytes = discarded, "bus: discarded stale bytes");
        }
        sleep(self.timing.settle);
        discarded
    }

    /// Wait (bounded) until `expected` bytes are buffered, then consume exactly
    /// that many. A short or missing response yields `None`.
    fn receive(&mut self, expected: usize) -> Option<Vec<u8>> {
        for _ in 0..self.timing.poll_attempts {
            match self.port.bytes_available() {
                Ok(n) if n >= expected => break,
                Ok(_) => sleep(self.timing.poll_interval),
                Err(e) => {
                    warn!("bus: poll failed: {e:#}");
                    return None;
                }
            }
        }

        let mut frame = vec![0u8; expected];
        let mut filled = 0;
        for _ in 0..MAX_READ_CHUNKS {
            if filled == expected {
                break;
            }
            match self.port.read(&mut frame[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => {
                    warn!("bus: read failed: {e:#}");
                    return None;
                }
            }
        }
        if filled < expected {
            debug!(expected, received = filled, "bus: response timed out");
            return None;
        }
        Some(frame)
    }

    /// One full exchange: drain, send, receive.
    fn exchange(&mut self, request: &[u8], expected: usize) -> Option<Vec<u8>> {
        self.drain_stale();
        if let Err(e) = self.port.write_all(request) {
            warn!("bus: write failed: {e:#}");
            return None;
        }
        self.receive(expected)
    }

    pub(crate) fn read_registers(
        &mut self,
        address: u8,
        function: u8,
        register: u16,
        count: u16,
    ) -> Option<Vec<u16>> {
        let request = modbus::build_request(address, function, register, count);
        let frame = self.exchange(&request, modbus::read_response_len(count))?;
        let parsed = modbus::parse_read_response(&frame, address, function, count);
        if parsed.is_none() {
            debug!(address, register, "bus: invalid response (crc/address mismatch)");
        }
        parsed
    }

    /// Read `count` registers and return the first one.
    pub(crate) fn read_register(
        &mut self,
        address: u8,
        function: u8,
        register: u16,
        count: u16,
    ) -> Option<u16> {
        self.read_registers(address, function, register, count)?
            .first()
            .copied()
    }

    /// Write one register and wait for the 8-byte echo.
    pub(crate) fn write_single_register(&mut self, address: u8, register: u16, value: u16) -> bool {
        let request = modbus::build_write_single(address, register, value);
        match self.exchange(&request, modbus::WRITE_ACK_LEN) {
            Some(ack) => modbus::is_write_ack(&ack, address, register),
            None => false,
        }
    }

    /// Retry a holding-register read with a fixed delay. `None` only after
    /// every attempt failed; callers must not wrap this in another retry.
    pub(crate) fn read_with_retries(
        &mut self,
        address: u8,
        register: u16,
        count: u16,
        retry: ReadRetry,
    ) -> Option<u16> {
        for attempt in 1..=retry.attempts {
            if let Some(v) = self.read_register(address, FN_READ_HOLDING, register, count) {
                return Some(v);
            }
            debug!(address, register, attempt, of = retry.attempts, "bus: read attempt failed");
            if attempt < retry.attempts {
                sleep(retry.delay);
            }
        }
        warn!(address, register, attempts = retry.attempts, "bus: read failed after retries");
        None
    }

    // -- Meter registers ----------------------------------------------------

    pub(crate) fn read_cumulative(&mut self, address: u8, retry: ReadRetry) -> Option<u32> {
        self.read_with_retries(address, modbus::REG_CUMULATIVE, 2, retry)
            .map(u32::from)
    }

    pub(crate) fn read_flow_rate(&mut self, address: u8) -> Option<u16> {
        self.read_register(address, FN_READ_HOLDING, modbus::REG_FLOW_RATE, 2)
    }

    pub(crate) fn read_cell_voltage(&mut self, address: u8) -> Option<f32> {
        self.read_register(address, FN_READ_HOLDING, modbus::REG_CELL_VOLTAGE, 1)
            .map(modbus::bcd_voltage)
    }

    /// Command the valve and give the actuator time to move. Returns whether
    /// the slave acknowledged.
    pub(crate) fn set_valve(&mut self, address: u8, open: bool) -> bool {
        let value = if open {
            modbus::VALVE_OPEN
        } else {
            modbus::VALVE_CLOSE
        };
        let acked = self.write_single_register(address, modbus::REG_VALVE, value);
        sleep(self.timing.valve_settle);
        acked
    }
}

fn sleep(d: Duration) {
    if !d.is_zero() {
        thread::sleep(d);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
