//! Daemon entry point.
//!
//! Boot order: parse the CLI, load and validate the config (violations are
//! fatal, exit 1), construct the shared state and components once, then
//! hand every long-lived loop to the supervisor. SIGINT/SIGTERM cancel the
//! shared token; a fatal supervised failure (bad secret, exhausted restart
//! budget) also exits 1.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use mcubridge::config::BridgeConfig;
use mcubridge::error::Result;
use mcubridge::metrics;
use mcubridge::mqtt::MqttService;
use mcubridge::mqtt::spool::MqttSpool;
use mcubridge::router::TopicAuthorization;
use mcubridge::rpc::flow::{FlowController, FlowTiming};
use mcubridge::serial::{SerialTransport, TtyFactory};
use mcubridge::services::{Bridge, BridgeContext};
use mcubridge::state::RuntimeState;
use mcubridge::supervisor::{TaskPolicy, supervise};

/// MQTT ⇄ MCU serial bridge daemon.
#[derive(Parser, Debug)]
#[command(name = "mcubridge", version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "/etc/mcubridge/config.toml")]
    config: String,

    /// Force debug logging regardless of the config.
    #[arg(long)]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    std::process::exit(run().await);
}

/// Fatal-at-boot steps, with context for the operator.
fn bootstrap(args: &Args) -> anyhow::Result<(BridgeConfig, MqttSpool)> {
    let config = BridgeConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config))?;
    config.validate().context("invalid configuration")?;
    let spool = MqttSpool::open(&config.mqtt_spool_dir, config.mqtt_spool_limit)
        .context("opening the outbound spool")?;
    Ok((config, spool))
}

async fn run() -> i32 {
    let args = Args::parse();

    // ── 1. Configuration (before logging: errors go to stderr) ──
    let (config, spool) = match bootstrap(&args) {
        Ok(parts) => parts,
        Err(err) => {
            eprintln!("mcubridge: {err:#}");
            return 1;
        }
    };

    // ── 2. Logging ────────────────────────────────────────────
    let default_filter = if args.debug || config.debug_logging {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter),
    )
    .init();

    info!(
        "mcubridge v{} ({}) starting, prefix '{}'",
        env!("CARGO_PKG_VERSION"),
        option_env!("BUILD_TIMESTAMP").unwrap_or("unknown build"),
        config.topic_prefix()
    );

    // ── 3. Shared state ───────────────────────────────────────
    let config = Arc::new(config);
    let state = Arc::new(RuntimeState::new(&config, spool));
    let shutdown = CancellationToken::new();

    // ── 4. Components ─────────────────────────────────────────
    let flow = Arc::new(FlowController::new(
        FlowTiming {
            ack_timeout: config.ack_timeout(),
            response_timeout: config.response_timeout(),
            max_attempts: u32::from(config.serial_retry_attempts),
            backoff_cap: config.ack_timeout() * 8,
        },
        state.clone(),
        shutdown.clone(),
    ));

    let ctx = Arc::new(BridgeContext::new(
        config.clone(),
        state.clone(),
        flow.clone(),
        TopicAuthorization::from_names(&config.denied_actions),
        shutdown.clone(),
    ));
    let bridge = Arc::new(Bridge::new(ctx.clone()));
    let router = Arc::new(bridge.build_router());

    let transport = Arc::new(SerialTransport::new(
        config.clone(),
        state.clone(),
        flow.clone(),
        bridge.clone(),
        Box::new(TtyFactory::new(&config.serial_port)),
        shutdown.clone(),
    ));
    let mqtt = Arc::new(MqttService::new(
        config.clone(),
        state.clone(),
        router,
        shutdown.clone(),
    ));

    // ── 5. Supervised task fabric ─────────────────────────────
    let policy = TaskPolicy::from_config(&config);
    let mut tasks: tokio::task::JoinSet<Result<()>> = tokio::task::JoinSet::new();

    {
        let transport = transport.clone();
        let state = state.clone();
        let policy = policy.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            supervise("serial-transport", state, policy, shutdown, move || {
                let transport = transport.clone();
                async move { transport.run().await }
            })
            .await
        });
    }
    {
        let mqtt = mqtt.clone();
        let state = state.clone();
        let policy = policy.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            supervise("mqtt-transport", state, policy, shutdown, move || {
                let mqtt = mqtt.clone();
                async move { mqtt.run().await }
            })
            .await
        });
    }
    {
        let ctx = ctx.clone();
        let state = state.clone();
        let policy = policy.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            supervise("metrics-summary", state, policy, shutdown, move || {
                let ctx = ctx.clone();
                async move { metrics::run_summary_task(ctx).await }
            })
            .await
        });
    }
    {
        let ctx = ctx.clone();
        let state = state.clone();
        let policy = policy.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            supervise("metrics-handshake", state, policy, shutdown, move || {
                let ctx = ctx.clone();
                async move { metrics::run_handshake_task(ctx).await }
            })
            .await
        });
    }
    {
        let ctx = ctx.clone();
        let state = state.clone();
        let policy = policy.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            supervise("status-file", state, policy, shutdown, move || {
                let ctx = ctx.clone();
                async move { metrics::run_status_task(ctx).await }
            })
            .await
        });
    }
    if config.watchdog_enabled {
        let ctx = ctx.clone();
        let state = state.clone();
        let policy = policy.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            supervise("watchdog", state, policy, shutdown, move || {
                let ctx = ctx.clone();
                async move { mcubridge::services::system::run_watchdog(ctx).await }
            })
            .await
        });
    }

    // ── 6. Signals ────────────────────────────────────────────
    {
        let shutdown = shutdown.clone();
        let _signal_watcher = tokio::spawn(async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    // ── 7. Run until the fabric drains ────────────────────────
    let mut exit_code = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!("fatal: {err}");
                exit_code = 1;
                shutdown.cancel();
            }
            Err(err) if err.is_panic() => {
                error!("task panicked: {err}");
                exit_code = 1;
                shutdown.cancel();
            }
            Err(_) => {}
        }
    }

    info!("mcubridge stopped");
    exit_code
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
