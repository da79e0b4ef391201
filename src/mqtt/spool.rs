//! Persistent outbound-publish spool.
//!
//! A JSON-lines file (`spool.jsonl`) under `mqtt_spool_dir` holding the
//! FIFO of publishes that did not fit in the in-memory queue. Capped at
//! `mqtt_spool_limit` rows with trim-oldest-on-overflow; corrupt rows are
//! skipped on load. When the spool itself fails it degrades: the reason is
//! recorded, appends are rejected until a retry backoff elapses, and the
//! daemon keeps running without persistence.

use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{info, warn};
use thiserror::Error;

use super::messages::QueuedPublish;

const SPOOL_FILE: &str = "spool.jsonl";

/// Cap on the degraded-retry backoff.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("cannot create spool dir {path}: {source}")]
    Create {
        path: String,
        source: std::io::Error,
    },

    #[error("spool I/O on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
struct Degraded {
    reason: String,
    retry_at: Instant,
    attempts: u32,
}

struct SpoolInner {
    path: PathBuf,
    entries: VecDeque<QueuedPublish>,
    limit: usize,
    dropped_limit: u64,
    degraded: Option<Degraded>,
}

/// Thread-safe spool handle stored in the runtime state.
pub struct MqttSpool {
    inner: Mutex<SpoolInner>,
}

impl MqttSpool {
    /// Open (or create) the spool, loading surviving rows from disk.
    pub fn open(dir: &str, limit: usize) -> Result<Self, SpoolError> {
        fs::create_dir_all(dir).map_err(|source| SpoolError::Create {
            path: dir.to_string(),
            source,
        })?;
        let path = Path::new(dir).join(SPOOL_FILE);

        let mut entries = VecDeque::new();
        if path.exists() {
            let text = fs::read_to_string(&path).map_err(|source| SpoolError::Io {
                path: path.display().to_string(),
                source,
            })?;
            let mut corrupt = 0usize;
            for line in text.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<QueuedPublish>(line) {
                    Ok(msg) => entries.push_back(msg),
                    Err(_) => corrupt += 1,
                }
            }
            if corrupt > 0 {
                warn!("spool: skipped {} corrupt rows in {}", corrupt, path.display());
            }
            while entries.len() > limit {
                entries.pop_front();
            }
            if !entries.is_empty() {
                info!("spool: restored {} queued publishes", entries.len());
            }
        }

        Ok(Self {
            inner: Mutex::new(SpoolInner {
                path,
                entries,
                limit,
                dropped_limit: 0,
                degraded: None,
            }),
        })
    }

    /// Append one publish. Oldest rows are trimmed past the limit.
    /// Returns false when the message was rejected (degraded spool) or
    /// the write failed (the spool degrades and the message is lost).
    pub fn append(&self, message: &QueuedPublish) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if let Some(degraded) = &inner.degraded {
            if Instant::now() < degraded.retry_at {
                return false;
            }
            // Backoff elapsed; this append is the retry probe.
        }

        inner.entries.push_back(message.clone());
        let mut trimmed = false;
        while inner.entries.len() > inner.limit {
            inner.entries.pop_front();
            inner.dropped_limit += 1;
            trimmed = true;
        }

        let result = if trimmed {
            // Dropping the oldest row requires rewriting the file.
            rewrite(&inner.path, &inner.entries)
        } else {
            append_row(&inner.path, message)
        };

        match result {
            Ok(()) => {
                if inner.degraded.take().is_some() {
                    info!("spool: recovered, persistence restored");
                }
                true
            }
            Err(err) => {
                degrade(&mut inner, &err);
                false
            }
        }
    }

    /// Take every spooled publish, in FIFO order, and truncate the file.
    pub fn drain(&self) -> Vec<QueuedPublish> {
        let mut inner = self.inner.lock().unwrap();
        let drained: Vec<_> = inner.entries.drain(..).collect();
        if !drained.is_empty() {
            if let Err(err) = rewrite(&inner.path, &inner.entries) {
                degrade(&mut inner, &err);
            }
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publishes trimmed because the spool was full.
    pub fn dropped_limit(&self) -> u64 {
        self.inner.lock().unwrap().dropped_limit
    }

    /// Degradation reason, if the spool is currently degraded.
    pub fn degraded_reason(&self) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .degraded
            .as_ref()
            .map(|d| d.reason.clone())
    }

    /// Degraded-retry attempts so far.
    pub fn retry_attempts(&self) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .degraded
            .as_ref()
            .map_or(0, |d| d.attempts)
    }
}

fn degrade(inner: &mut SpoolInner, err: &std::io::Error) {
    let attempts = inner.degraded.as_ref().map_or(0, |d| d.attempts) + 1;
    let backoff = Duration::from_secs(1u64 << attempts.min(6)).min(MAX_RETRY_BACKOFF);
    let reason = err.kind().to_string().replace(' ', "-");
    warn!(
        "spool: degraded ({reason}), retrying in {:.0}s (attempt {attempts})",
        backoff.as_secs_f64()
    );
    inner.degraded = Some(Degraded {
        reason,
        retry_at: Instant::now() + backoff,
        attempts,
    });
}

fn append_row(path: &Path, message: &QueuedPublish) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    let row = serde_json::to_string(message).map_err(std::io::Error::other)?;
    file.write_all(row.as_bytes())?;
    file.write_all(b"\n")
}

fn rewrite(path: &Path, entries: &VecDeque<QueuedPublish>) -> std::io::Result<()> {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&serde_json::to_string(entry).map_err(std::io::Error::other)?);
        out.push('\n');
    }
    fs::write(path, out)
}

// ── Tests ────────────────────────────────────────────────────
