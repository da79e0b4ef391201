//! Unified error types for the bridge daemon.
//!
//! Frame, COBS, and RLE failures are recovered locally in the serial
//! transport (dropped frame + counter) and never reach this level. What the
//! supervisor sees is this enum: `is_fatal()` separates the classes that
//! must terminate the daemon from the ones that restart with backoff.

use thiserror::Error;

use crate::config::ConfigError;
use crate::mqtt::spool::SpoolError;
use crate::rpc::handshake::HandshakeError;

/// Every supervised task funnels its failures into this type.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Configuration is invalid; always fatal at boot.
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    /// Link handshake failed; fatal once the consecutive-failure
    /// threshold is crossed.
    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),

    /// Serial transport I/O failure; the supervisor reconnects.
    #[error("serial: {0}")]
    Serial(#[from] std::io::Error),

    /// MQTT transport failure; the supervisor reconnects with backoff.
    #[error("mqtt: {0}")]
    Mqtt(String),

    /// Spool persistence failure; the spool degrades, the task retries.
    #[error("spool: {0}")]
    Spool(#[from] SpoolError),

    /// Cooperative shutdown; never restarted.
    #[error("shutdown requested")]
    Cancelled,
}

impl BridgeError {
    /// Fatal errors bypass supervisor retry and terminate the daemon.
    pub fn is_fatal(&self) -> bool {
        match self {
            BridgeError::Config(_) => true,
            BridgeError::Handshake(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, BridgeError>;
