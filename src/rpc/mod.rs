//! Serial RPC protocol stack.
//!
//! Layering, wire-side first:
//!
//! - [`wire`] — COBS byte stuffing and packet splitting on the 0x00 delimiter
//! - [`frame`] — header + payload + CRC32 build/parse
//! - [`rle`] — optional payload compression behind the command-id flag bit
//! - [`protocol`] — command/status tables and protocol constants
//! - [`handshake`] — authenticated link sync with anti-replay
//! - [`flow`] — pending-command tracking, ACK/response correlation, retries

pub mod flow;
pub mod frame;
pub mod handshake;
pub mod protocol;
pub mod rle;
pub mod wire;
