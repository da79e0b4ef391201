//! RPC protocol tables and constants.
//!
//! The canonical definition lives in `tools/protocol/spec.toml`; the tables
//! here and the MCU-side C header are generated from it and kept in sync by
//! `tests/protocol_contract.rs`. Command and status codes share one 16-bit
//! space split into two disjoint ranges: statuses start at
//! [`STATUS_CODE_MIN`], commands at 0x0040. The top bit of a command id on
//! the wire is [`CMD_FLAG_COMPRESSED`]; the low 15 bits carry the code.

/// Wire protocol version carried in every frame header.
pub const PROTOCOL_VERSION: u8 = 2;

/// Maximum payload bytes per frame.
pub const MAX_PAYLOAD_SIZE: usize = 255;

/// Header bytes covered by the CRC: version (1) + payload_len (2) + command_id (2).
pub const CRC_COVERED_HEADER_SIZE: usize = 5;

/// CRC32 trailer size.
pub const CRC_SIZE: usize = 4;

/// Smallest possible frame: header + empty payload + CRC.
pub const MIN_FRAME_SIZE: usize = CRC_COVERED_HEADER_SIZE + CRC_SIZE;

/// Largest COBS packet the serial reader will accumulate before it starts
/// discarding up to the next delimiter.
pub const MAX_SERIAL_PACKET_BYTES: usize = 600;

/// Top bit of the command id: payload is RLE-compressed.
pub const CMD_FLAG_COMPRESSED: u16 = 0x8000;

/// Mask selecting the command/status code from a wire command id.
pub const CMD_ID_MASK: u16 = 0x7FFF;

/// Lowest valid code; anything below is a malformed frame.
pub const STATUS_CODE_MIN: u16 = 0x0010;

/// Sentinel process id returned when a spawn is rejected.
pub const INVALID_ID_SENTINEL: u16 = 0xFFFF;

// ── Handshake parameters ─────────────────────────────────────

/// Link-sync nonce: 8 random bytes followed by a 64-bit big-endian counter.
pub const HANDSHAKE_NONCE_LENGTH: usize = 16;

/// Authentication tag: HMAC-SHA256 output truncated to 16 bytes.
pub const HANDSHAKE_TAG_LENGTH: usize = 16;

/// Tag algorithm name as published in the protocol spec.
pub const HANDSHAKE_TAG_ALGORITHM: &str = "hmac-sha256";

/// Link config payload: u16 ack_timeout_ms, u8 retry_limit, u32 response_timeout_ms
/// (all big-endian).
pub const HANDSHAKE_CONFIG_SIZE: usize = 7;

pub const HANDSHAKE_ACK_TIMEOUT_MIN_MS: u16 = 100;
pub const HANDSHAKE_ACK_TIMEOUT_MAX_MS: u16 = 5_000;
pub const HANDSHAKE_RESPONSE_TIMEOUT_MIN_MS: u32 = 1_000;
pub const HANDSHAKE_RESPONSE_TIMEOUT_MAX_MS: u32 = 600_000;
pub const HANDSHAKE_RETRY_LIMIT_MIN: u8 = 1;
pub const HANDSHAKE_RETRY_LIMIT_MAX: u8 = 10;

/// Historical placeholder secret; refused at boot.
pub const PLACEHOLDER_SECRET: &str = "changeme-secret";

// ── Status codes ─────────────────────────────────────────────

/// Link-level status codes (0x0010..=0x001F).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Status {
    Ack = 0x0010,
    Ok = 0x0011,
    Error = 0x0012,
    Malformed = 0x0013,
    Timeout = 0x0014,
    Unsupported = 0x0015,
}

impl Status {
    pub const ALL: &'static [Status] = &[
        Status::Ack,
        Status::Ok,
        Status::Error,
        Status::Malformed,
        Status::Timeout,
        Status::Unsupported,
    ];

    pub fn from_u16(raw: u16) -> Option<Status> {
        Self::ALL.iter().copied().find(|s| *s as u16 == raw)
    }

    /// Spec name, e.g. `ACK`.
    pub fn name(self) -> &'static str {
        match self {
            Status::Ack => "ACK",
            Status::Ok => "OK",
            Status::Error => "ERROR",
            Status::Malformed => "MALFORMED",
            Status::Timeout => "TIMEOUT",
            Status::Unsupported => "UNSUPPORTED",
        }
    }

    /// True if `raw` (flag bit stripped) falls in the status range.
    pub fn is_status_code(raw: u16) -> bool {
        (STATUS_CODE_MIN..0x0040).contains(&raw)
    }
}

// ── Commands ─────────────────────────────────────────────────

/// RPC commands. `*Resp` variants answer the same-named request; pairing is
/// inferred from the names and enforced by the contract test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    // Link management
    LinkSync = 0x0040,
    LinkSyncResp = 0x0041,
    LinkConfig = 0x0042,
    LinkReset = 0x0043,
    LinkResetResp = 0x0044,
    SetBaudrate = 0x0045,
    SetBaudrateResp = 0x0046,
    Keepalive = 0x0047,
    Capabilities = 0x0048,

    // Pin I/O
    SetPinMode = 0x0050,
    DigitalWrite = 0x0051,
    DigitalRead = 0x0052,
    DigitalReadResp = 0x0053,
    AnalogWrite = 0x0054,
    AnalogRead = 0x0055,
    AnalogReadResp = 0x0056,

    // Console
    ConsoleWrite = 0x0060,
    ConsoleXon = 0x0061,
    ConsoleXoff = 0x0062,

    // Datastore
    DatastorePut = 0x0070,
    DatastoreGet = 0x0071,
    DatastoreGetResp = 0x0072,

    // File I/O
    FileWrite = 0x0080,
    FileRead = 0x0081,
    FileReadResp = 0x0082,
    FileRemove = 0x0083,

    // Mailbox
    MailboxAvailable = 0x0090,
    MailboxAvailableResp = 0x0091,
    MailboxRead = 0x0092,
    MailboxReadResp = 0x0093,
    MailboxPush = 0x0094,

    // Host processes
    ProcessRun = 0x00A0,
    ProcessRunResp = 0x00A1,
    ProcessRunAsync = 0x00A2,
    ProcessRunAsyncResp = 0x00A3,
    ProcessPoll = 0x00A4,
    ProcessPollResp = 0x00A5,
    ProcessKill = 0x00A6,

    // System
    GetVersion = 0x00B0,
    GetVersionResp = 0x00B1,
    GetFreeMemory = 0x00B2,
    GetFreeMemoryResp = 0x00B3,
}

impl Command {
    pub const ALL: &'static [Command] = &[
        Command::LinkSync,
        Command::LinkSyncResp,
        Command::LinkConfig,
        Command::LinkReset,
        Command::LinkResetResp,
        Command::SetBaudrate,
        Command::SetBaudrateResp,
        Command::Keepalive,
        Command::Capabilities,
        Command::SetPinMode,
        Command::DigitalWrite,
        Command::DigitalRead,
        Command::DigitalReadResp,
        Command::AnalogWrite,
        Command::AnalogRead,
        Command::AnalogReadResp,
        Command::ConsoleWrite,
        Command::ConsoleXon,
        Command::ConsoleXoff,
        Command::DatastorePut,
        Command::DatastoreGet,
        Command::DatastoreGetResp,
        Command::FileWrite,
        Command::FileRead,
        Command::FileReadResp,
        Command::FileRemove,
        Command::MailboxAvailable,
        Command::MailboxAvailableResp,
        Command::MailboxRead,
        Command::MailboxReadResp,
        Command::MailboxPush,
        Command::ProcessRun,
        Command::ProcessRunResp,
        Command::ProcessRunAsync,
        Command::ProcessRunAsyncResp,
        Command::ProcessPoll,
        Command::ProcessPollResp,
        Command::ProcessKill,
        Command::GetVersion,
        Command::GetVersionResp,
        Command::GetFreeMemory,
        Command::GetFreeMemoryResp,
    ];

    pub fn from_u16(raw: u16) -> Option<Command> {
        Self::ALL.iter().copied().find(|c| *c as u16 == raw)
    }

    /// Spec name, e.g. `CMD_DIGITAL_READ_RESP`.
    pub fn name(self) -> &'static str {
        match self {
            Command::LinkSync => "CMD_LINK_SYNC",
            Command::LinkSyncResp => "CMD_LINK_SYNC_RESP",
            Command::LinkConfig => "CMD_LINK_CONFIG",
            Command::LinkReset => "CMD_LINK_RESET",
            Command::LinkResetResp => "CMD_LINK_RESET_RESP",
            Command::SetBaudrate => "CMD_SET_BAUDRATE",
            Command::SetBaudrateResp => "CMD_SET_BAUDRATE_RESP",
            Command::Keepalive => "CMD_KEEPALIVE",
            Command::Capabilities => "CMD_CAPABILITIES",
            Command::SetPinMode => "CMD_SET_PIN_MODE",
            Command::DigitalWrite => "CMD_DIGITAL_WRITE",
            Command::DigitalRead => "CMD_DIGITAL_READ",
            Command::DigitalReadResp => "CMD_DIGITAL_READ_RESP",
            Command::AnalogWrite => "CMD_ANALOG_WRITE",
            Command::AnalogRead => "CMD_ANALOG_READ",
            Command::AnalogReadResp => "CMD_ANALOG_READ_RESP",
            Command::ConsoleWrite => "CMD_CONSOLE_WRITE",
            Command::ConsoleXon => "CMD_CONSOLE_XON",
            Command::ConsoleXoff => "CMD_CONSOLE_XOFF",
            Command::DatastorePut => "CMD_DATASTORE_PUT",
            Command::DatastoreGet => "CMD_DATASTORE_GET",
            Command::DatastoreGetResp => "CMD_DATASTORE_GET_RESP",
            Command::FileWrite => "CMD_FILE_WRITE",
            Command::FileRead => "CMD_FILE_READ",
            Command::FileReadResp => "CMD_FILE_READ_RESP",
            Command::FileRemove => "CMD_FILE_REMOVE",
            Command::MailboxAvailable => "CMD_MAILBOX_AVAILABLE",
            Command::MailboxAvailableResp => "CMD_MAILBOX_AVAILABLE_RESP",
            Command::MailboxRead => "CMD_MAILBOX_READ",
            Command::MailboxReadResp => "CMD_MAILBOX_READ_RESP",
            Command::MailboxPush => "CMD_MAILBOX_PUSH",
            Command::ProcessRun => "CMD_PROCESS_RUN",
            Command::ProcessRunResp => "CMD_PROCESS_RUN_RESP",
            Command::ProcessRunAsync => "CMD_PROCESS_RUN_ASYNC",
            Command::ProcessRunAsyncResp => "CMD_PROCESS_RUN_ASYNC_RESP",
            Command::ProcessPoll => "CMD_PROCESS_POLL",
            Command::ProcessPollResp => "CMD_PROCESS_POLL_RESP",
            Command::ProcessKill => "CMD_PROCESS_KILL",
            Command::GetVersion => "CMD_GET_VERSION",
            Command::GetVersionResp => "CMD_GET_VERSION_RESP",
            Command::GetFreeMemory => "CMD_GET_FREE_MEMORY",
            Command::GetFreeMemoryResp => "CMD_GET_FREE_MEMORY_RESP",
        }
    }

    /// The `*_RESP` command answering this request, if it has one.
    /// Inferred from the name pairing; verified by the contract test.
    pub fn response(self) -> Option<Command> {
        match self {
            Command::LinkSync => Some(Command::LinkSyncResp),
            Command::LinkReset => Some(Command::LinkResetResp),
            Command::SetBaudrate => Some(Command::SetBaudrateResp),
            Command::DigitalRead => Some(Command::DigitalReadResp),
            Command::AnalogRead => Some(Command::AnalogReadResp),
            Command::DatastoreGet => Some(Command::DatastoreGetResp),
            Command::FileRead => Some(Command::FileReadResp),
            Command::MailboxAvailable => Some(Command::MailboxAvailableResp),
            Command::MailboxRead => Some(Command::MailboxReadResp),
            Command::ProcessRun => Some(Command::ProcessRunResp),
            Command::ProcessRunAsync => Some(Command::ProcessRunAsyncResp),
            Command::ProcessPoll => Some(Command::ProcessPollResp),
            Command::GetVersion => Some(Command::GetVersionResp),
            Command::GetFreeMemory => Some(Command::GetFreeMemoryResp),
            _ => None,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
