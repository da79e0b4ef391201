//! Daemon configuration.
//!
//! Loaded once at boot from a TOML file (on OpenWrt the init script
//! materialises it from UCI). Every knob has a default so a minimal config
//! only needs the serial port and the shared secret. `validate()` enforces
//! the startup preconditions; any violation is fatal (exit code 1).

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::rpc::protocol::{
    HANDSHAKE_ACK_TIMEOUT_MAX_MS, HANDSHAKE_ACK_TIMEOUT_MIN_MS, HANDSHAKE_RESPONSE_TIMEOUT_MAX_MS,
    HANDSHAKE_RESPONSE_TIMEOUT_MIN_MS, HANDSHAKE_RETRY_LIMIT_MAX, HANDSHAKE_RETRY_LIMIT_MIN,
    PLACEHOLDER_SECRET,
};

/// Paths considered volatile (tmpfs-backed) on the target routers.
/// Flash protection: spool and file roots must resolve under one of these
/// unless `allow_non_tmp_paths` is set (and the spool dir always must).
const VOLATILE_PREFIXES: &[&str] = &["/tmp", "/run", "/var/run", "/var/volatile", "/dev/shm"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("mqtt_topic is empty after normalisation")]
    EmptyTopic,

    #[error("{name} must be positive (got {value})")]
    InvalidInterval { name: &'static str, value: f64 },

    #[error("serial_shared_secret too short: {0} bytes (minimum 8)")]
    SecretTooShort(usize),

    #[error("serial_shared_secret too uniform: {0} distinct bytes (minimum 4)")]
    SecretTooUniform(usize),

    #[error("serial_shared_secret is the placeholder value; set a real secret")]
    SecretPlaceholder,

    #[error("{name} = {path} is not under a volatile path{hint}")]
    FlashProtection {
        name: &'static str,
        path: String,
        hint: &'static str,
    },

    #[error("{name} = {value} outside protocol range {min}..={max}")]
    OutOfRange {
        name: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
}

/// All recognised options. Field names match the UCI option names.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    // --- Serial link ---
    pub serial_port: String,
    pub serial_baud: u32,
    pub serial_safe_baud: u32,
    pub serial_shared_secret: String,
    /// ACK wait per attempt, seconds.
    pub serial_retry_timeout: f64,
    /// Response wait after ACK, seconds.
    pub serial_response_timeout: f64,
    pub serial_retry_attempts: u8,
    /// Minimum spacing between handshake attempts, seconds.
    pub serial_handshake_min_interval: f64,
    /// Consecutive handshake failures before the daemon gives up.
    pub serial_handshake_fatal_failures: u32,
    /// Delay before reopening the port after a disconnect, seconds.
    pub reconnect_delay: f64,

    // --- MQTT ---
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: Option<String>,
    pub mqtt_pass: Option<String>,
    pub mqtt_tls: bool,
    pub mqtt_cafile: Option<String>,
    pub mqtt_certfile: Option<String>,
    pub mqtt_keyfile: Option<String>,
    pub mqtt_tls_insecure: bool,
    /// Topic prefix for the whole surface.
    pub mqtt_topic: String,
    pub mqtt_queue_limit: usize,
    pub mqtt_spool_dir: String,
    pub mqtt_spool_limit: usize,

    // --- File service ---
    pub file_system_root: String,
    pub file_write_max_bytes: usize,
    pub file_storage_quota_bytes: u64,
    pub allow_non_tmp_paths: bool,

    // --- Policy ---
    /// Ingress actions to deny (e.g. `file_write`, `console_input`).
    pub denied_actions: Vec<String>,

    // --- Process service ---
    pub allowed_commands: Vec<String>,
    /// Synchronous run timeout, seconds.
    pub process_timeout: f64,
    pub process_max_output_bytes: usize,
    pub process_max_concurrent: usize,

    // --- Queues ---
    pub console_queue_limit_bytes: usize,
    pub mailbox_queue_limit: usize,
    pub mailbox_queue_bytes_limit: usize,
    pub pending_pin_request_limit: usize,

    // --- Telemetry ---
    /// Status file cadence, seconds.
    pub status_interval: f64,
    pub status_file: String,
    pub bridge_summary_interval: f64,
    pub bridge_handshake_interval: f64,
    pub watchdog_enabled: bool,
    /// Keepalive beat cadence, seconds.
    pub watchdog_interval: f64,

    // --- Supervisor ---
    pub supervisor_min_backoff: f64,
    pub supervisor_max_backoff: f64,
    pub supervisor_max_restarts: Option<u32>,
    pub supervisor_restart_interval: f64,

    pub debug_logging: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            serial_port: "/dev/ttyATH0".into(),
            serial_baud: 250_000,
            serial_safe_baud: 115_200,
            serial_shared_secret: String::new(),
            serial_retry_timeout: 0.75,
            serial_response_timeout: 120.0,
            serial_retry_attempts: 3,
            serial_handshake_min_interval: 5.0,
            serial_handshake_fatal_failures: 5,
            reconnect_delay: 2.0,

            mqtt_host: "localhost".into(),
            mqtt_port: 1883,
            mqtt_user: None,
            mqtt_pass: None,
            mqtt_tls: false,
            mqtt_cafile: None,
            mqtt_certfile: None,
            mqtt_keyfile: None,
            mqtt_tls_insecure: false,
            mqtt_topic: "br".into(),
            mqtt_queue_limit: 128,
            mqtt_spool_dir: "/tmp/mcubridge/spool".into(),
            mqtt_spool_limit: 1_000,

            file_system_root: "/tmp/mcubridge/files".into(),
            file_write_max_bytes: 128 * 1024,
            file_storage_quota_bytes: 1024 * 1024,
            allow_non_tmp_paths: false,

            denied_actions: Vec::new(),

            allowed_commands: Vec::new(),
            process_timeout: 30.0,
            process_max_output_bytes: 64 * 1024,
            process_max_concurrent: 4,

            console_queue_limit_bytes: 16 * 1024,
            mailbox_queue_limit: 64,
            mailbox_queue_bytes_limit: 32 * 1024,
            pending_pin_request_limit: 32,

            status_interval: 30.0,
            status_file: "/tmp/mcubridge/status.json".into(),
            bridge_summary_interval: 60.0,
            bridge_handshake_interval: 300.0,
            watchdog_enabled: false,
            watchdog_interval: 30.0,

            supervisor_min_backoff: 0.5,
            supervisor_max_backoff: 30.0,
            supervisor_max_restarts: None,
            supervisor_restart_interval: 60.0,

            debug_logging: false,
        }
    }
}

impl BridgeConfig {
    /// Load and parse a TOML config file. Does not validate.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Topic prefix with slash runs collapsed and edges trimmed.
    pub fn topic_prefix(&self) -> String {
        self.mqtt_topic
            .split('/')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.serial_retry_timeout)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.serial_response_timeout)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs_f64(self.reconnect_delay)
    }

    /// Startup precondition checks; any failure is fatal at boot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic_prefix().is_empty() {
            return Err(ConfigError::EmptyTopic);
        }

        for (name, value) in [
            ("status_interval", self.status_interval),
            ("bridge_summary_interval", self.bridge_summary_interval),
            ("bridge_handshake_interval", self.bridge_handshake_interval),
            (
                "serial_handshake_min_interval",
                self.serial_handshake_min_interval,
            ),
        ] {
            if value <= 0.0 {
                return Err(ConfigError::InvalidInterval { name, value });
            }
        }
        if self.watchdog_enabled && self.watchdog_interval <= 0.0 {
            return Err(ConfigError::InvalidInterval {
                name: "watchdog_interval",
                value: self.watchdog_interval,
            });
        }
        if self.serial_handshake_fatal_failures == 0 {
            return Err(ConfigError::InvalidInterval {
                name: "serial_handshake_fatal_failures",
                value: 0.0,
            });
        }

        self.validate_secret()?;
        self.validate_link_timing()?;

        // Flash protection. The spool dir has no escape hatch: a dead
        // broker must never wear out router flash.
        if !is_volatile_path(&self.mqtt_spool_dir) {
            return Err(ConfigError::FlashProtection {
                name: "mqtt_spool_dir",
                path: self.mqtt_spool_dir.clone(),
                hint: "",
            });
        }
        if !self.allow_non_tmp_paths && !is_volatile_path(&self.file_system_root) {
            return Err(ConfigError::FlashProtection {
                name: "file_system_root",
                path: self.file_system_root.clone(),
                hint: " (set allow_non_tmp_paths to override)",
            });
        }

        Ok(())
    }

    fn validate_secret(&self) -> Result<(), ConfigError> {
        let secret = self.serial_shared_secret.as_bytes();
        if secret.len() < 8 {
            return Err(ConfigError::SecretTooShort(secret.len()));
        }
        let mut seen = [false; 256];
        let mut distinct = 0;
        for &b in secret {
            if !seen[b as usize] {
                seen[b as usize] = true;
                distinct += 1;
            }
        }
        if distinct < 4 {
            return Err(ConfigError::SecretTooUniform(distinct));
        }
        if self.serial_shared_secret == PLACEHOLDER_SECRET {
            return Err(ConfigError::SecretPlaceholder);
        }
        Ok(())
    }

    fn validate_link_timing(&self) -> Result<(), ConfigError> {
        let ack_ms = (self.serial_retry_timeout * 1000.0) as u64;
        if ack_ms < u64::from(HANDSHAKE_ACK_TIMEOUT_MIN_MS)
            || ack_ms > u64::from(HANDSHAKE_ACK_TIMEOUT_MAX_MS)
        {
            return Err(ConfigError::OutOfRange {
                name: "serial_retry_timeout",
                value: ack_ms,
                min: u64::from(HANDSHAKE_ACK_TIMEOUT_MIN_MS),
                max: u64::from(HANDSHAKE_ACK_TIMEOUT_MAX_MS),
            });
        }
        let resp_ms = (self.serial_response_timeout * 1000.0) as u64;
        if resp_ms < u64::from(HANDSHAKE_RESPONSE_TIMEOUT_MIN_MS)
            || resp_ms > u64::from(HANDSHAKE_RESPONSE_TIMEOUT_MAX_MS)
        {
            return Err(ConfigError::OutOfRange {
                name: "serial_response_timeout",
                value: resp_ms,
                min: u64::from(HANDSHAKE_RESPONSE_TIMEOUT_MIN_MS),
                max: u64::from(HANDSHAKE_RESPONSE_TIMEOUT_MAX_MS),
            });
        }
        if self.serial_retry_attempts < HANDSHAKE_RETRY_LIMIT_MIN
            || self.serial_retry_attempts > HANDSHAKE_RETRY_LIMIT_MAX
        {
            return Err(ConfigError::OutOfRange {
                name: "serial_retry_attempts",
                value: u64::from(self.serial_retry_attempts),
                min: u64::from(HANDSHAKE_RETRY_LIMIT_MIN),
                max: u64::from(HANDSHAKE_RETRY_LIMIT_MAX),
            });
        }
        Ok(())
    }
}

fn is_volatile_path(path: &str) -> bool {
    let p = Path::new(path);
    VOLATILE_PREFIXES
        .iter()
        .any(|prefix| p.starts_with(prefix))
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> BridgeConfig {
        BridgeConfig {
            serial_shared_secret: "mcubridge-shared".into(),
            ..BridgeConfig::default()
        }
    }

    #[test]
    fn defaults_validate_with_secret() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn topic_prefix_collapses_slashes() {
        let mut cfg = valid_config();
        cfg.mqtt_topic = "//br//bridge/".into();
        assert_eq!(cfg.topic_prefix(), "br/bridge");
    }

    #[test]
    fn empty_topic_rejected() {
        let mut cfg = valid_config();
        cfg.mqtt_topic = "///".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyTopic)));
    }

    #[test]
    fn zero_status_interval_rejected() {
        let mut cfg = valid_config();
        cfg.status_interval = 0.0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidInterval { name: "status_interval", .. })
        ));
    }

    #[test]
    fn watchdog_interval_checked_only_when_enabled() {
        let mut cfg = valid_config();
        cfg.watchdog_interval = 0.0;
        assert!(cfg.validate().is_ok());
        cfg.watchdog_enabled = true;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn secret_rules() {
        let mut cfg = valid_config();
        cfg.serial_shared_secret = "short".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::SecretTooShort(5))));

        cfg.serial_shared_secret = "aabbaabbaabb".into();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::SecretTooUniform(2))
        ));

        cfg.serial_shared_secret = PLACEHOLDER_SECRET.into();
        assert!(matches!(cfg.validate(), Err(ConfigError::SecretPlaceholder)));
    }

    #[test]
    fn spool_dir_must_be_volatile_even_with_escape_flag() {
        let mut cfg = valid_config();
        cfg.allow_non_tmp_paths = true;
        cfg.mqtt_spool_dir = "/etc/mcubridge/spool".into();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::FlashProtection { name: "mqtt_spool_dir", .. })
        ));
    }

    #[test]
    fn file_root_escape_flag_works() {
        let mut cfg = valid_config();
        cfg.file_system_root = "/srv/files".into();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::FlashProtection { name: "file_system_root", .. })
        ));
        cfg.allow_non_tmp_paths = true;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn link_timing_ranges_enforced() {
        let mut cfg = valid_config();
        cfg.serial_retry_timeout = 0.01;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::OutOfRange { name: "serial_retry_timeout", .. })
        ));

        let mut cfg = valid_config();
        cfg.serial_retry_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_minimal_toml() {
        let cfg: BridgeConfig = toml::from_str(
            r#"
            serial_port = "/dev/ttyUSB0"
            serial_shared_secret = "mcubridge-shared"
            mqtt_topic = "br"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.serial_port, "/dev/ttyUSB0");
        assert_eq!(cfg.mqtt_port, 1883);
        assert!(cfg.validate().is_ok());
    }
}
