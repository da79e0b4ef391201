//! RPC frame build/parse (v2).
//!
//! Wire format, before COBS framing:
//! ```text
//! ┌─────────┬──────────────┬─────────────┬──────────┬────────────┐
//! │ Version │ Payload len  │ Command id  │ Payload  │ CRC32 (BE) │
//! │ (1B)    │ (2B, BE)     │ (2B, BE)    │ (N B)    │ (4B)       │
//! └─────────┴──────────────┴─────────────┴──────────┴────────────┘
//! ```
//!
//! The CRC covers version || payload_len || command_id || payload. COBS
//! encoding and the 0x00 delimiter are the transport's job ([`super::wire`]);
//! this module only deals in raw frames.

use thiserror::Error;

use super::protocol::{
    CMD_ID_MASK, CRC_COVERED_HEADER_SIZE, CRC_SIZE, MAX_PAYLOAD_SIZE, MIN_FRAME_SIZE,
    PROTOCOL_VERSION, STATUS_CODE_MIN,
};

/// Frame-level parse/build failures.
///
/// `CrcMismatch` is split out from the other malformations because the
/// serial transport accounts for it separately (`serial_crc_errors` vs
/// `serial_decode_errors`).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("incomplete frame: {got} bytes, need at least {MIN_FRAME_SIZE}")]
    Incomplete { got: usize },

    #[error("CRC mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    CrcMismatch { expected: u32, computed: u32 },

    #[error("unsupported protocol version {0} (current {PROTOCOL_VERSION})")]
    UnsupportedVersion(u8),

    #[error("invalid command id {0:#06x} (below status range)")]
    InvalidCommandId(u16),

    #[error("payload length mismatch: header declares {declared}, frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("payload too large: {0} bytes (max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge(usize),
}

/// Build one frame from a command id (flag bit allowed) and payload.
pub fn build(command_id: u16, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }
    if command_id & CMD_ID_MASK < STATUS_CODE_MIN {
        return Err(FrameError::InvalidCommandId(command_id));
    }

    let mut out = Vec::with_capacity(CRC_COVERED_HEADER_SIZE + payload.len() + CRC_SIZE);
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(&command_id.to_be_bytes());
    out.extend_from_slice(payload);

    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    Ok(out)
}

/// Parse one frame, returning `(command_id, payload)`.
///
/// The returned command id still carries the compression flag if the MCU
/// set it; stripping the flag and RLE-decoding is the transport's job.
pub fn parse(raw: &[u8]) -> Result<(u16, Vec<u8>), FrameError> {
    if raw.len() < MIN_FRAME_SIZE {
        return Err(FrameError::Incomplete { got: raw.len() });
    }

    let body = &raw[..raw.len() - CRC_SIZE];
    let expected = u32::from_be_bytes([
        raw[raw.len() - 4],
        raw[raw.len() - 3],
        raw[raw.len() - 2],
        raw[raw.len() - 1],
    ]);
    let computed = crc32fast::hash(body);
    if expected != computed {
        return Err(FrameError::CrcMismatch { expected, computed });
    }

    let version = body[0];
    if version != PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }

    let declared = u16::from_be_bytes([body[1], body[2]]) as usize;
    let command_id = u16::from_be_bytes([body[3], body[4]]);
    if command_id & CMD_ID_MASK < STATUS_CODE_MIN {
        return Err(FrameError::InvalidCommandId(command_id));
    }

    let actual = body.len() - CRC_COVERED_HEADER_SIZE;
    if declared != actual {
        return Err(FrameError::LengthMismatch { declared, actual });
    }

    Ok((command_id, body[CRC_COVERED_HEADER_SIZE..].to_vec()))
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::protocol::{CMD_FLAG_COMPRESSED, Command};

    const TEST_CMD_ID: u16 = 0x1234;

    #[test]
    fn build_parse_round_trip() {
        let payload = [0x01, 0x02, 0x03];
        let raw = build(TEST_CMD_ID, &payload).unwrap();
        assert_eq!(raw.len(), CRC_COVERED_HEADER_SIZE + payload.len() + CRC_SIZE);

        let (cmd, body) = parse(&raw).unwrap();
        assert_eq!(cmd, TEST_CMD_ID);
        assert_eq!(body, payload);
    }

    #[test]
    fn empty_payload_round_trip() {
        let raw = build(Command::Keepalive as u16, &[]).unwrap();
        assert_eq!(raw.len(), MIN_FRAME_SIZE);
        let (cmd, body) = parse(&raw).unwrap();
        assert_eq!(cmd, Command::Keepalive as u16);
        assert!(body.is_empty());
    }

    #[test]
    fn build_rejects_large_payload() {
        let payload = vec![b'a'; MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(
            build(Command::SetPinMode as u16, &payload),
            Err(FrameError::PayloadTooLarge(_))
        ));
        // Boundary: exactly MAX_PAYLOAD_SIZE succeeds.
        assert!(build(Command::SetPinMode as u16, &payload[..MAX_PAYLOAD_SIZE]).is_ok());
    }

    #[test]
    fn build_rejects_invalid_command_id() {
        assert!(matches!(
            build(STATUS_CODE_MIN - 1, b""),
            Err(FrameError::InvalidCommandId(_))
        ));
    }

    #[test]
    fn build_accepts_compressed_flag() {
        let wire_id = Command::ConsoleWrite as u16 | CMD_FLAG_COMPRESSED;
        let raw = build(wire_id, b"x").unwrap();
        let (cmd, _) = parse(&raw).unwrap();
        assert_eq!(cmd, wire_id);
    }

    #[test]
    fn parse_rejects_short_frame() {
        assert!(matches!(
            parse(b"short"),
            Err(FrameError::Incomplete { got: 5 })
        ));
    }

    #[test]
    fn parse_detects_crc_mismatch() {
        let mut raw = build(Command::ConsoleWrite as u16, b"valid").unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        assert!(matches!(parse(&raw), Err(FrameError::CrcMismatch { .. })));
    }

    #[test]
    fn parse_rejects_wrong_version() {
        let mut raw = build(Command::DatastorePut as u16, b"data").unwrap();
        raw[0] ^= 1;
        // Re-seal the CRC so the version check is what fires.
        let body_len = raw.len() - CRC_SIZE;
        let crc = crc32fast::hash(&raw[..body_len]);
        raw[body_len..].copy_from_slice(&crc.to_be_bytes());
        assert!(matches!(
            parse(&raw),
            Err(FrameError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn parse_rejects_length_mismatch() {
        let mut raw = build(Command::DatastoreGet as u16, b"data").unwrap();
        raw[1] = 0;
        raw[2] = 0;
        let body_len = raw.len() - CRC_SIZE;
        let crc = crc32fast::hash(&raw[..body_len]);
        raw[body_len..].copy_from_slice(&crc.to_be_bytes());
        assert!(matches!(
            parse(&raw),
            Err(FrameError::LengthMismatch { declared: 0, actual: 4 })
        ));
    }

    #[test]
    fn parse_rejects_status_range_underflow() {
        let mut raw = build(Command::ConsoleWrite as u16, b"").unwrap();
        // Rewrite the command id below the status range and re-seal.
        raw[3] = 0x00;
        raw[4] = 0x0F;
        let body_len = raw.len() - CRC_SIZE;
        let crc = crc32fast::hash(&raw[..body_len]);
        raw[body_len..].copy_from_slice(&crc.to_be_bytes());
        assert!(matches!(
            parse(&raw),
            Err(FrameError::InvalidCommandId(0x000F))
        ));
    }
}
