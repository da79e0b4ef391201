//! Periodic status snapshots.
//!
//! Three supervised tickers publish the observable state of the bridge:
//!
//! - **summary** — `system/bridge/summary/value` every
//!   `bridge_summary_interval`, tagged `bridge-snapshot=summary` plus the
//!   watchdog and spool user properties;
//! - **handshake** — `system/bridge/handshake/value` every
//!   `bridge_handshake_interval`, tagged `bridge-snapshot=handshake`;
//! - **status file** — the summary JSON written atomically (temp file +
//!   rename) every `status_interval` for out-of-band monitoring, and the
//!   latency/throughput numbers on `system/metrics`.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::{debug, warn};
use serde_json::json;

use crate::error::Result;
use crate::mqtt::messages::QueuedPublish;
use crate::services::BridgeContext;
use crate::state::unix_now;

/// Summary snapshot of every counter the bridge maintains.
pub fn build_summary(ctx: &BridgeContext) -> serde_json::Value {
    let state = &ctx.state;
    let queue = state.mqtt_queue.lock().unwrap();
    let mailbox_out = state.mailbox_outgoing.lock().unwrap();
    let mailbox_in = state.mailbox_incoming.lock().unwrap();
    let console = state.console_queue.lock().unwrap();
    let supervisor: std::collections::HashMap<String, serde_json::Value> = state
        .supervisor
        .lock()
        .unwrap()
        .iter()
        .map(|(name, health)| {
            (
                name.clone(),
                json!({
                    "restarts": health.restarts,
                    "last_error": health.last_error,
                    "backoff_seconds": health.backoff_secs,
                    "fatal": health.fatal,
                }),
            )
        })
        .collect();

    json!({
        "timestamp": unix_now(),
        "uptime_seconds": state.uptime().as_secs(),
        "serial_synced": state.serial_synced.load(Ordering::Relaxed),
        "mcu_paused": state.mcu_paused.load(Ordering::Relaxed),
        "serial": {
            "commands_sent": state.flow.sent.load(Ordering::Relaxed),
            "commands_acked": state.flow.acked.load(Ordering::Relaxed),
            "retries": state.flow.retries.load(Ordering::Relaxed),
            "failures": state.flow.failures.load(Ordering::Relaxed),
            "timeouts": state.flow.timeouts.load(Ordering::Relaxed),
            "cancelled": state.flow.cancelled.load(Ordering::Relaxed),
            "last_event_unix": state.flow.last_event_unix.load(Ordering::Relaxed),
            "crc_errors": state.serial_errors.crc_errors.load(Ordering::Relaxed),
            "decode_errors": state.serial_errors.decode_errors.load(Ordering::Relaxed),
            "oversize_packets": state.serial_errors.oversize_packets.load(Ordering::Relaxed),
            "unexpected_status": state.serial_errors.unexpected_status.load(Ordering::Relaxed),
            "bytes_in": state.serial_bytes_in.load(Ordering::Relaxed),
            "bytes_out": state.serial_bytes_out.load(Ordering::Relaxed),
        },
        "mqtt": {
            "queue_depth": queue.len(),
            "queue_dropped": queue.dropped(),
            "published": state.mqtt_published.load(Ordering::Relaxed),
            "requeued": state.mqtt_requeued.load(Ordering::Relaxed),
            "mqtt_spool_depth": state.spool.len(),
            "mqtt_spool_degraded": state.spool.degraded_reason().is_some(),
            "mqtt_spool_dropped_limit": state.spool.dropped_limit(),
            "mqtt_spool_retry_attempts": state.spool.retry_attempts(),
        },
        "mailbox": {
            "outgoing": mailbox_out.len(),
            "outgoing_bytes": mailbox_out.bytes(),
            "outgoing_dropped": mailbox_out.dropped(),
            "incoming": mailbox_in.len(),
            "incoming_bytes": mailbox_in.bytes(),
            "incoming_dropped": mailbox_in.dropped(),
        },
        "console_queue_bytes": console.bytes(),
        "pending_reads": {
            "digital": state.pending_digital.lock().unwrap().len(),
            "analog": state.pending_analog.lock().unwrap().len(),
        },
        "processes": state.processes.lock().unwrap().len(),
        "datastore_keys": state.datastore.lock().unwrap().len(),
        "supervisor": supervisor,
    })
}

/// Latency histogram + throughput, for `system/metrics`.
pub fn build_metrics(ctx: &BridgeContext) -> serde_json::Value {
    let histogram: std::collections::BTreeMap<String, u64> = ctx
        .state
        .latency
        .lock()
        .unwrap()
        .snapshot()
        .into_iter()
        .collect();
    json!({
        "timestamp": unix_now(),
        "command_latency_ms": histogram,
        "serial_bytes_in": ctx.state.serial_bytes_in.load(Ordering::Relaxed),
        "serial_bytes_out": ctx.state.serial_bytes_out.load(Ordering::Relaxed),
    })
}

fn build_handshake(ctx: &BridgeContext) -> serde_json::Value {
    let hs = ctx.state.handshake.lock().unwrap();
    json!({
        "timestamp": unix_now(),
        "attempts": hs.attempts,
        "failures": hs.failures,
        "consecutive_failures": hs.consecutive_failures,
        "last_failure": hs.last_failure,
        "last_success_unix": hs.last_success_unix,
        "replay_counter": hs.replay_counter,
    })
}

fn summary_publish(ctx: &BridgeContext) -> QueuedPublish {
    let mut message = QueuedPublish::new(
        ctx.topic("system/bridge/summary/value"),
        build_summary(ctx).to_string().into_bytes(),
    )
    .user_property("bridge-snapshot", "summary")
    .user_property(
        "bridge-watchdog-enabled",
        ctx.config.watchdog_enabled.to_string(),
    )
    .user_property(
        "bridge-watchdog-interval",
        format!("{}", ctx.config.watchdog_interval),
    );
    if let Some(reason) = ctx.state.spool.degraded_reason() {
        message = message.user_property("bridge-spool", reason);
    }
    message
}

/// Summary + metrics ticker.
pub async fn run_summary_task(ctx: Arc<BridgeContext>) -> Result<()> {
    let interval = Duration::from_secs_f64(ctx.config.bridge_summary_interval);
    loop {
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = ctx.shutdown.cancelled() => return Ok(()),
        }
        ctx.publish(summary_publish(&ctx));
        ctx.publish(QueuedPublish::new(
            ctx.topic("system/metrics"),
            build_metrics(&ctx).to_string().into_bytes(),
        ));
    }
}

/// Handshake snapshot ticker.
pub async fn run_handshake_task(ctx: Arc<BridgeContext>) -> Result<()> {
    let interval = Duration::from_secs_f64(ctx.config.bridge_handshake_interval);
    loop {
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = ctx.shutdown.cancelled() => return Ok(()),
        }
        let message = QueuedPublish::new(
            ctx.topic("system/bridge/handshake/value"),
            build_handshake(&ctx).to_string().into_bytes(),
        )
        .user_property("bridge-snapshot", "handshake");
        ctx.publish(message);
    }
}

/// Status-file ticker. Failures degrade to a warning; monitoring must not
/// take the bridge down.
pub async fn run_status_task(ctx: Arc<BridgeContext>) -> Result<()> {
    let interval = Duration::from_secs_f64(ctx.config.status_interval);
    loop {
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = ctx.shutdown.cancelled() => return Ok(()),
        }
        if let Err(err) = write_status_file(&ctx.config.status_file, &build_summary(&ctx)) {
            warn!("status: cannot write {}: {err}", ctx.config.status_file);
        } else {
            debug!("status: wrote {}", ctx.config.status_file);
        }
    }
}

/// Write the snapshot atomically: temp file in the same directory, then
/// rename over the target.
pub fn write_status_file(path: &str, snapshot: &serde_json::Value) -> std::io::Result<()> {
    let target = std::path::Path::new(path);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = target.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)?;
    std::fs::rename(&tmp, target)
}

// ── Tests ────────────────────────────────────────────────────
