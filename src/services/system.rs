//! System-level commands, the capability record, and the watchdog beat.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};

use crate::error::Result;
use crate::mqtt::messages::QueuedPublish;
use crate::router::{Action, InboundMessage, RouteMatch, Topic, TopicHandler};
use crate::rpc::flow::SendOutcome;
use crate::rpc::protocol::Command;
use crate::state::McuCapabilities;

use super::BridgeContext;

pub struct SystemService {
    ctx: Arc<BridgeContext>,
}

impl SystemService {
    pub fn new(ctx: Arc<BridgeContext>) -> Self {
        Self { ctx }
    }

    // ── From MCU ──────────────────────────────────────────────

    pub async fn on_mcu_frame(&self, command: Command, payload: &[u8]) {
        match command {
            Command::GetVersion => {
                let (major, minor) = crate_version();
                self.ctx
                    .respond_mcu(Command::GetVersionResp, &[major, minor])
                    .await;
            }

            Command::GetFreeMemory => {
                let kib = free_memory_kib();
                self.ctx
                    .respond_mcu(Command::GetFreeMemoryResp, &kib.to_be_bytes())
                    .await;
            }

            Command::LinkReset => {
                info!("system: MCU requested link reset");
                self.ctx.state.serial_synced.store(false, Ordering::Relaxed);
                self.ctx.respond_mcu(Command::LinkResetResp, &[]).await;
                self.ctx.flow.request_reconnect();
            }

            Command::Capabilities => match parse_capabilities(payload) {
                Some(caps) => {
                    info!(
                        "system: MCU capabilities: proto={} arch={} digital={} analog={} features={:#06x}",
                        caps.protocol_version,
                        caps.board_arch,
                        caps.num_digital_pins,
                        caps.num_analog_inputs,
                        caps.feature_bits
                    );
                    *self.ctx.state.capabilities.lock().unwrap() = Some(caps);
                }
                None => warn!("system: malformed capability record"),
            },

            // Beat echoed back by some firmwares; nothing to do.
            Command::Keepalive => {}

            other => debug!("system: ignoring {}", other.name()),
        }
    }

    fn publish_handshake_snapshot(&self) {
        let snapshot = {
            let hs = self.ctx.state.handshake.lock().unwrap();
            serde_json::json!({
                "attempts": hs.attempts,
                "failures": hs.failures,
                "consecutive_failures": hs.consecutive_failures,
                "last_failure": hs.last_failure,
                "last_success_unix": hs.last_success_unix,
                "replay_counter": hs.replay_counter,
                "serial_synced": self.ctx.state.serial_synced.load(Ordering::Relaxed),
            })
        };
        let message = QueuedPublish::new(
            self.ctx.topic("system/bridge/handshake/value"),
            snapshot.to_string().into_bytes(),
        )
        .user_property("bridge-snapshot", "handshake");
        self.ctx.publish(message);
    }
}

/// Watchdog keepalive loop: a minimal beat frame at `watchdog_interval`
/// whenever the link is synced. The MCU resets the link when beats stop.
pub async fn run_watchdog(ctx: Arc<BridgeContext>) -> Result<()> {
    let interval = Duration::from_secs_f64(ctx.config.watchdog_interval);
    loop {
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = ctx.shutdown.cancelled() => return Ok(()),
        }

        if !ctx.state.serial_synced.load(Ordering::Relaxed) {
            continue;
        }
        match ctx.send_frame(Command::Keepalive, &[]).await {
            SendOutcome::Success(_) => {}
            SendOutcome::Cancelled => return Ok(()),
            outcome => {
                warn!("watchdog: beat failed ({outcome:?})");
            }
        }
    }
}

fn crate_version() -> (u8, u8) {
    let mut parts = env!("CARGO_PKG_VERSION").split('.');
    let major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (major, minor)
}

/// Available host memory in KiB, from /proc/meminfo.
fn free_memory_kib() -> u32 {
    let Ok(text) = std::fs::read_to_string("/proc/meminfo") else {
        return 0;
    };
    for key in ["MemAvailable:", "MemFree:"] {
        if let Some(line) = text.lines().find(|l| l.starts_with(key)) {
            if let Some(value) = line.split_whitespace().nth(1) {
                return value.parse().unwrap_or(0);
            }
        }
    }
    0
}

/// `u8 proto, u8 digital, u8 analog, u16 features (BE), u8 arch_len, arch`.
fn parse_capabilities(payload: &[u8]) -> Option<McuCapabilities> {
    if payload.len() < 6 {
        return None;
    }
    let arch_len = payload[5] as usize;
    if payload.len() < 6 + arch_len {
        return None;
    }
    Some(McuCapabilities {
        protocol_version: payload[0],
        num_digital_pins: payload[1],
        num_analog_inputs: payload[2],
        feature_bits: u16::from_be_bytes([payload[3], payload[4]]),
        board_arch: String::from_utf8_lossy(&payload[6..6 + arch_len]).into_owned(),
    })
}

#[async_trait]
impl TopicHandler for SystemService {
    async fn handle(&self, route: &RouteMatch, _message: &InboundMessage) -> bool {
        match route.segment(0) {
            Some("handshake") => {
                if !self.ctx.authorized(Topic::System, Action::SystemCommand) {
                    return true;
                }
                self.publish_handshake_snapshot();
                true
            }
            // Topics the metrics task publishes under system/.
            Some("bridge" | "metrics") => true,
            _ => false,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
