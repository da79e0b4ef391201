//! MCU Bridge — MQTT ⇄ serial-RPC gateway daemon.
//!
//! Bridges an MQTT broker with a microcontroller over one framed serial
//! link: COBS packets carrying CRC32-protected frames, optional RLE
//! payload compression, an HMAC-authenticated link handshake with
//! anti-replay, and a strictly serialised command flow with retries.
//!
//! ```text
//! ┌─────┐   serial    ┌───────────┐  frames  ┌──────────────┐
//! │ MCU │◀──────────▶│ transport  │◀───────▶│ flow control  │
//! └─────┘  COBS/CRC   └─────┬─────┘          └──────┬───────┘
//!                           │ ingress               │ commands
//!                     ┌─────▼───────────────────────▼──────┐
//!                     │        service components          │
//!                     │ pin·console·datastore·file·mailbox │
//!                     │          process·system            │
//!                     └─────┬──────────────────────────────┘
//!                           │ runtime state (queues, spool)
//!                     ┌─────▼─────┐   ┌────────┐
//!                     │   MQTT    │◀─▶│ broker │
//!                     └───────────┘   └────────┘
//! ```
//!
//! Every long-lived loop runs under the [`supervisor`]; the shared
//! [`state::RuntimeState`] is the single substrate for queues, pending
//! reads, the process table, and metrics.

pub mod config;
pub mod error;
pub mod metrics;
pub mod mqtt;
pub mod router;
pub mod rpc;
pub mod serial;
pub mod services;
pub mod state;
pub mod supervisor;
