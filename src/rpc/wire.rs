//! COBS byte stuffing and the serial packet splitter.
//!
//! Outbound frames are COBS-encoded and terminated by a single 0x00 byte;
//! inbound bytes are accumulated by [`PacketSplitter`], which emits one
//! packet per delimiter and enforces [`MAX_SERIAL_PACKET_BYTES`] by
//! switching into a discarding state until the next delimiter.

use thiserror::Error;

use super::protocol::MAX_SERIAL_PACKET_BYTES;

/// COBS decode failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CobsError {
    #[error("COBS block overruns packet (code {code} at offset {offset})")]
    Overrun { code: u8, offset: usize },

    #[error("unexpected zero byte inside COBS packet at offset {0}")]
    EmbeddedZero(usize),

    #[error("empty COBS packet")]
    Empty,
}

/// COBS-encode `data`. The returned bytes contain no zeros; the caller
/// appends the 0x00 delimiter when writing to the wire.
pub fn cobs_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 254 + 1);
    let mut code_idx = out.len();
    out.push(0); // placeholder for the first code byte
    let mut code: u8 = 1;

    for &byte in data {
        if byte == 0 {
            out[code_idx] = code;
            code_idx = out.len();
            out.push(0);
            code = 1;
        } else {
            out.push(byte);
            code += 1;
            if code == 0xFF {
                out[code_idx] = code;
                code_idx = out.len();
                out.push(0);
                code = 1;
            }
        }
    }

    out[code_idx] = code;
    out
}

/// Decode one COBS packet (delimiter already stripped).
pub fn cobs_decode(packet: &[u8]) -> Result<Vec<u8>, CobsError> {
    if packet.is_empty() {
        return Err(CobsError::Empty);
    }

    let mut out = Vec::with_capacity(packet.len());
    let mut i = 0;

    while i < packet.len() {
        let code = packet[i];
        if code == 0 {
            return Err(CobsError::EmbeddedZero(i));
        }
        let block_end = i + code as usize;
        if block_end > packet.len() {
            return Err(CobsError::Overrun { code, offset: i });
        }
        for &byte in &packet[i + 1..block_end] {
            if byte == 0 {
                return Err(CobsError::EmbeddedZero(i));
            }
            out.push(byte);
        }
        i = block_end;
        // A maximal block (code 0xFF) encodes no zero; anything shorter
        // implies a zero byte unless it terminated the packet.
        if code != 0xFF && i < packet.len() {
            out.push(0);
        }
    }

    Ok(out)
}

// ── Packet splitter ──────────────────────────────────────────

/// Accumulates raw serial bytes and splits them into COBS packets on the
/// 0x00 delimiter.
///
/// Oversized packets flip the splitter into a discarding state: bytes are
/// dropped until the next delimiter and `oversize_drops` is bumped. The
/// splitter is reset after a transport reconnect.
pub struct PacketSplitter {
    buf: Vec<u8>,
    discarding: bool,
    oversize_drops: u64,
}

impl Default for PacketSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketSplitter {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(MAX_SERIAL_PACKET_BYTES),
            discarding: false,
            oversize_drops: 0,
        }
    }

    /// Feed raw bytes; invoke `emit` once per complete (delimited) packet.
    /// Empty packets (back-to-back delimiters) are skipped.
    pub fn feed(&mut self, data: &[u8], mut emit: impl FnMut(&[u8])) {
        for &byte in data {
            if byte == 0 {
                if self.discarding {
                    self.discarding = false;
                } else if !self.buf.is_empty() {
                    emit(&self.buf);
                }
                self.buf.clear();
                continue;
            }

            if self.discarding {
                continue;
            }

            self.buf.push(byte);
            if self.buf.len() > MAX_SERIAL_PACKET_BYTES {
                self.buf.clear();
                self.discarding = true;
                self.oversize_drops += 1;
            }
        }
    }

    /// Packets dropped because they exceeded [`MAX_SERIAL_PACKET_BYTES`].
    pub fn oversize_drops(&self) -> u64 {
        self.oversize_drops
    }

    /// Reset accumulation state (after a reconnect).
    pub fn reset(&mut self) {
        self.buf.clear();
        self.discarding = false;
    }
}

// ── Tests ────────────────────────────────────────────────────
