//! Modbus RTU framing for the meter field bus: request builders, CRC16 and
//! response validation. Pure functions only; the byte exchange lives in
//! `bus.rs`.

// ---------------------------------------------------------------------------
// Function codes & registers
// ---------------------------------------------------------------------------

/// Read holding registers.
pub(crate) const FN_READ_HOLDING: u8 = 0x03;
/// Write multiple registers (the meters only accept this form for writes).
pub(crate) const FN_WRITE_MULTIPLE: u8 = 0x10;

/// Cumulative volume in litres (first register of a two-register block).
pub(crate) const REG_CUMULATIVE: u16 = 0x000E;
/// Instantaneous flow (first register of a two-register block).
pub(crate) const REG_FLOW_RATE: u16 = 0x0014;
/// Cell voltage, BCD encoded hundredths of a volt.
pub(crate) const REG_CELL_VOLTAGE: u16 = 0x0016;
/// Valve command register.
pub(crate) const REG_VALVE: u16 = 0x0060;

pub(crate) const VALVE_OPEN: u16 = 0x0001;
pub(crate) const VALVE_CLOSE: u16 = 0x0002;

/// Length of a write-multiple acknowledgment: addr, fn, reg(2), count(2), crc(2).
pub(crate) const WRITE_ACK_LEN: usize = 8;

const CRC_INIT: u16 = 0xFFFF;
const CRC_POLY: u16 = 0xA001;

// ---------------------------------------------------------------------------
// CRC
// ---------------------------------------------------------------------------

/// Modbus RTU CRC16 (reflected polynomial 0xA001, initial value 0xFFFF).
pub(crate) fn crc16(data: &[u8]) -> u16 {
    let mut crc = CRC_INIT;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ CRC_POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Check the trailing little-endian CRC of a frame. Frames shorter than three
/// bytes cannot carry a payload and never verify.
pub(crate) fn verify_crc(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    crc16(body) == received
}

fn append_crc(body: &[u8], out: &mut [u8]) {
    let crc = crc16(body).to_le_bytes();
    out[body.len()] = crc[0];
    out[body.len() + 1] = crc[1];
}

// ---------------------------------------------------------------------------
// Request builders
// ---------------------------------------------------------------------------

/// `[addr][fn][reg hi][reg lo][count hi][count lo][crc lo][crc hi]`
pub(crate) fn build_request(address: u8, function: u8, register: u16, count: u16) -> [u8; 8] {
    let mut frame = [0u8; 8];
    frame[0] = address;
    frame[1] = function;
    frame[2..4].copy_from_slice(&register.to_be_bytes());
    frame[4..6].copy_from_slice(&count.to_be_bytes());
    let body = frame[..6].to_vec();
    append_crc(&body, &mut frame);
    frame
}

/// Single-register write in write-multiple form: count 1, byte count 2.
pub(crate) fn build_write_single(address: u8, register: u16, value: u16) -> [u8; 11] {
    let mut frame = [0u8; 11];
    frame[0] = address;
    frame[1] = FN_WRITE_MULTIPLE;
    frame[2..4].copy_from_slice(&register.to_be_bytes());
    frame[4..6].copy_from_slice(&1u16.to_be_bytes());
    frame[6] = 2;
    frame[7..9].copy_from_slice(&value.to_be_bytes());
    let body = frame[..9].to_vec();
    append_crc(&body, &mut frame);
    frame
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// Expected length of a read response carrying `count` registers.
pub(crate) fn read_response_len(count: u16) -> usize {
    5 + 2 * count as usize
}

/// Validate a read response and return its registers. Anything short, corrupt
/// or answered by another slave yields `None`.
pub(crate) fn parse_read_response(
    frame: &[u8],
    address: u8,
    function: u8,
    count: u16,
) -> Option<Vec<u16>> {
    if frame.len() != read_response_len(count) || !verify_crc(frame) {
        return None;
    }
    if frame[0] != address || frame[1] != function || frame[2] as usize != 2 * count as usize {
        return None;
    }
    let registers = frame[3..frame.len() - 2]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    Some(registers)
}

/// A write acknowledgment echoes address, function, register and count.
pub(crate) fn is_write_ack(frame: &[u8], address: u8, register: u16) -> bool {
    frame.len() == WRITE_ACK_LEN
        && verify_crc(frame)
        && frame[0] == address
        && frame[1] == FN_WRITE_MULTIPLE
        && frame[2..4] == register.to_be_bytes()
}

/// Build a read response frame. Used by the simulated bus.
pub(crate) fn build_read_response(address: u8, registers: &[u16]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(read_response_len(registers.len() as u16));
    frame.push(address);
    frame.push(FN_READ_HOLDING);
    frame.push((registers.len() * 2) as u8);
    for r in registers {
        frame.extend_from_slice(&r.to_be_bytes());
    }
    let crc = crc16(&frame).to_le_bytes();
    frame.extend_from_slice(&crc);
    frame
}

/// Build the 8-byte acknowledgment a slave sends for a write. Used by the
/// simulated bus.
pub(crate) fn build_write_ack(address: u8, register: u16) -> [u8; 8] {
    build_request(address, FN_WRITE_MULTIPLE, register, 1)
}

/// Decode a BCD cell-voltage register (`0x0365` → 3.65 V).
pub(crate) fn bcd_voltage(raw: u16) -> f32 {
    let [hi, lo] = raw.to_be_bytes();
    let digits = |b: u8| ((b >> 4) & 0x0F) as u32 * 10 + (b & 0x0F) as u32;
    (digits(hi) * 100 + digits(lo)) as f32 * 0.01
}

// ===========================================================================
// Tests
// ===========================================================================
