//! Task supervision with bounded restarts.
//!
//! Every long-lived loop (serial transport, MQTT transport, publisher,
//! metrics, watchdog) runs under [`supervise`]: transient failures restart
//! the task with exponential backoff, fatal failures propagate and take the
//! daemon down, and an attempt that stayed up longer than the restart
//! window resets the backoff before the next failure is counted.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::state::RuntimeState;

/// Floor for the healthy-runtime window so tiny restart intervals do not
/// defeat backoff.
const MIN_RESTART_WINDOW: Duration = Duration::from_secs(5);

/// Restart policy for one supervised task.
#[derive(Debug, Clone)]
pub struct TaskPolicy {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// `None` = restart forever.
    pub max_restarts: Option<u32>,
    /// Runtime past which an attempt counts as healthy.
    pub restart_interval: Duration,
}

impl TaskPolicy {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            min_backoff: Duration::from_secs_f64(config.supervisor_min_backoff),
            max_backoff: Duration::from_secs_f64(config.supervisor_max_backoff),
            max_restarts: config.supervisor_max_restarts,
            restart_interval: Duration::from_secs_f64(config.supervisor_restart_interval),
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.saturating_sub(1).min(32) as i32);
        let secs = (self.min_backoff.as_secs_f64() * factor).min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Run `factory()` forever, restarting per `policy`.
///
/// Returns `Ok(())` on clean exit or shutdown, `Err` when the task failed
/// fatally or exhausted its restart budget; the caller treats any `Err` as
/// daemon-fatal.
pub async fn supervise<F, Fut>(
    name: &'static str,
    state: Arc<RuntimeState>,
    policy: TaskPolicy,
    shutdown: CancellationToken,
    mut factory: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let window = policy.restart_interval.max(MIN_RESTART_WINDOW);
    let mut attempt: u32 = 0;

    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }

        let started = Instant::now();
        let result = tokio::select! {
            result = factory() => result,
            () = shutdown.cancelled() => return Ok(()),
        };

        let error = match result {
            Ok(()) => {
                warn!("{name}: exited cleanly; supervisor exiting");
                state.mark_supervisor_healthy(name);
                return Ok(());
            }
            Err(BridgeError::Cancelled) => return Ok(()),
            Err(e) => e,
        };

        if error.is_fatal() {
            error!("{name}: fatal failure: {error}");
            state.record_supervisor_failure(name, Duration::ZERO, &error.to_string(), true);
            return Err(error);
        }

        if started.elapsed() > window && attempt > 0 {
            info!("{name}: was healthy long enough; resetting backoff");
            state.mark_supervisor_healthy(name);
            attempt = 0;
        }

        attempt += 1;
        if let Some(max) = policy.max_restarts {
            if attempt > max {
                error!("{name}: exceeded {max} restarts in window; giving up");
                state.record_supervisor_failure(name, Duration::ZERO, &error.to_string(), true);
                return Err(error);
            }
        }

        let backoff = policy.backoff_for(attempt);
        state.record_supervisor_failure(name, backoff, &error.to_string(), false);
        error!(
            "{name}: failed ({error}); restarting in {:.1}s",
            backoff.as_secs_f64()
        );

        tokio::select! {
            () = tokio::time::sleep(backoff) => {}
            () = shutdown.cancelled() => return Ok(()),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::spool::MqttSpool;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_state() -> Arc<RuntimeState> {
        let dir = tempfile::tempdir().unwrap();
        let spool = MqttSpool::open(dir.path().to_str().unwrap(), 4).unwrap();
        Arc::new(RuntimeState::new(&BridgeConfig::default(), spool))
    }

    fn fast_policy() -> TaskPolicy {
        TaskPolicy {
            min_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(80),
            max_restarts: None,
            restart_interval: Duration::from_secs(60),
        }
    }

    fn io_failure() -> BridgeError {
        BridgeError::Serial(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "eof"))
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_until_clean_exit() {
        let state = test_state();
        let runs = Arc::new(AtomicU32::new(0));
        let runs2 = runs.clone();

        let result = supervise(
            "test-task",
            state.clone(),
            fast_policy(),
            CancellationToken::new(),
            move || {
                let runs = runs2.clone();
                async move {
                    if runs.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(io_failure())
                    } else {
                        Ok(())
                    }
                }
            },
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        let table = state.supervisor.lock().unwrap();
        assert_eq!(table["test-task"].restarts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn max_restarts_gives_up() {
        let state = test_state();
        let policy = TaskPolicy {
            max_restarts: Some(2),
            ..fast_policy()
        };
        let runs = Arc::new(AtomicU32::new(0));
        let runs2 = runs.clone();

        let result = supervise(
            "flappy",
            state.clone(),
            policy,
            CancellationToken::new(),
            move || {
                runs2.fetch_add(1, Ordering::SeqCst);
                async { Err(io_failure()) }
            },
        )
        .await;

        assert!(result.is_err());
        // max_restarts + 1 attempts in total.
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        let table = state.supervisor.lock().unwrap();
        assert!(table["flappy"].fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_bypasses_retry() {
        let state = test_state();
        let runs = Arc::new(AtomicU32::new(0));
        let runs2 = runs.clone();

        let result = supervise(
            "handshaker",
            state.clone(),
            fast_policy(),
            CancellationToken::new(),
            move || {
                runs2.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(BridgeError::Handshake(
                        crate::rpc::handshake::HandshakeError::Fatal {
                            failures: 5,
                            last: "tag mismatch".into(),
                        },
                    ))
                }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let table = state.supervisor.lock().unwrap();
        assert!(table["handshaker"].fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_run_resets_backoff() {
        let state = test_state();
        let policy = TaskPolicy {
            max_restarts: Some(3),
            restart_interval: Duration::from_secs(10),
            ..fast_policy()
        };
        let runs = Arc::new(AtomicU32::new(0));
        let runs2 = runs.clone();

        let result = supervise(
            "slow-burner",
            state.clone(),
            policy,
            CancellationToken::new(),
            move || {
                let n = runs2.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 6 {
                        // Outlive the restart window each time, so every
                        // failure counts from a clean slate.
                        tokio::time::sleep(Duration::from_secs(15)).await;
                        Err(io_failure())
                    } else {
                        Ok(())
                    }
                }
            },
        )
        .await;

        // Six failures with max_restarts=3 only works because each healthy
        // runtime resets the counter.
        assert!(result.is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_restart_loop() {
        let state = test_state();
        let token = CancellationToken::new();
        let inner = token.clone();

        let handle = tokio::spawn(supervise(
            "looper",
            state,
            fast_policy(),
            token.clone(),
            move || {
                let _keep = inner.clone();
                async { Err(io_failure()) }
            },
        ));

        tokio::time::sleep(Duration::from_millis(5)).await;
        token.cancel();
        assert!(handle.await.unwrap().is_ok());
    }
}
