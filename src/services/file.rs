//! File I/O under a jailed root.
//!
//! Paths resolve under `file_system_root`; absolute paths and `..`
//! traversal are rejected outright. Writes enforce the per-call cap
//! (`file_write_max_bytes`) and the cumulative quota across tracked files
//! (`file_storage_quota_bytes`). MCU-side reads come back as chunked
//! `CMD_FILE_READ_RESP` frames when the content exceeds one payload.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, warn};

use crate::mqtt::messages::QueuedPublish;
use crate::router::{Action, InboundMessage, RouteMatch, Topic, TopicHandler};
use crate::rpc::protocol::{Command, MAX_PAYLOAD_SIZE, Status};

use super::BridgeContext;

/// Writes above this log a warning (flash wear on the target hardware).
const FILE_LARGE_WARNING_BYTES: usize = 64 * 1024;

/// Chunk flag marking the final `CMD_FILE_READ_RESP`.
const CHUNK_FLAG_LAST: u8 = 0x01;

#[derive(Debug, PartialEq, Eq)]
enum FileDenied {
    BadPath,
    TooLarge,
    QuotaBlocked,
}

pub struct FileService {
    ctx: Arc<BridgeContext>,
    /// Bytes currently attributed to each tracked file.
    tracked: Arc<Mutex<HashMap<PathBuf, u64>>>,
}

impl FileService {
    pub fn new(ctx: Arc<BridgeContext>) -> Self {
        Self {
            ctx,
            tracked: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Resolve a client path under the jail. Absolute paths, `..`
    /// segments, and empty paths are contract violations.
    fn resolve(&self, relative: &str) -> Option<PathBuf> {
        if relative.is_empty() {
            return None;
        }
        let path = Path::new(relative);
        if path.is_absolute() {
            return None;
        }
        if path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }
        Some(Path::new(&self.ctx.config.file_system_root).join(path))
    }

    /// Pre-flight checks for a write of `len` bytes to `target`.
    fn check_write(&self, target: &Path, len: usize) -> Result<(), FileDenied> {
        if len > self.ctx.config.file_write_max_bytes {
            return Err(FileDenied::TooLarge);
        }
        if len > FILE_LARGE_WARNING_BYTES {
            warn!(
                "file: large write of {} bytes to {}",
                len,
                target.display()
            );
        }

        let tracked = self.tracked.lock().unwrap();
        let existing = tracked.get(target).copied().unwrap_or(0);
        let total: u64 = tracked.values().sum::<u64>() - existing + len as u64;
        if total > self.ctx.config.file_storage_quota_bytes {
            return Err(FileDenied::QuotaBlocked);
        }
        Ok(())
    }

    fn track(&self, target: &Path, len: u64) {
        self.tracked.lock().unwrap().insert(target.to_path_buf(), len);
    }

    fn untrack(&self, target: &Path) {
        self.tracked.lock().unwrap().remove(target);
    }

    fn event_topic(&self, relative: &str) -> String {
        self.ctx.topic(format!("file/read/response/{relative}"))
    }

    fn publish_denied(&self, relative: &str, denied: &FileDenied) {
        let message = QueuedPublish::new(self.event_topic(relative), Vec::new());
        let message = match denied {
            FileDenied::QuotaBlocked => message.user_property("bridge-files", "quota-blocked"),
            FileDenied::TooLarge => message.bridge_error("file-too-large"),
            FileDenied::BadPath => message.bridge_error("file-path"),
        };
        self.ctx.publish(message);
    }

    async fn write_file(&self, target: &Path, data: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, data).await?;
        self.track(target, data.len() as u64);
        Ok(())
    }

    // ── From MQTT ─────────────────────────────────────────────

    async fn handle_write(&self, relative: &str, message: &InboundMessage) -> bool {
        if !self.ctx.authorized(Topic::File, Action::FileWrite) {
            return true;
        }
        let Some(target) = self.resolve(relative) else {
            self.publish_denied(relative, &FileDenied::BadPath);
            return true;
        };
        if let Err(denied) = self.check_write(&target, message.payload.len()) {
            self.publish_denied(relative, &denied);
            return true;
        }
        if let Err(err) = self.write_file(&target, &message.payload).await {
            warn!("file: write {} failed: {}", target.display(), err);
            let event = QueuedPublish::new(self.event_topic(relative), Vec::new())
                .bridge_error("file-io");
            self.ctx.publish(event);
        }
        true
    }

    async fn handle_read(&self, relative: &str, message: &InboundMessage) -> bool {
        if !self.ctx.authorized(Topic::File, Action::FileRead) {
            return true;
        }
        let Some(target) = self.resolve(relative) else {
            self.publish_denied(relative, &FileDenied::BadPath);
            return true;
        };
        let response = match tokio::fs::read(&target).await {
            Ok(content) => QueuedPublish::new(self.event_topic(relative), content),
            Err(err) => {
                debug!("file: read {} failed: {}", target.display(), err);
                QueuedPublish::new(self.event_topic(relative), Vec::new())
                    .bridge_error("file-not-found")
            }
        };
        self.ctx.publish(
            response.reply_to(message.response_topic.clone(), message.correlation.clone()),
        );
        true
    }

    async fn handle_remove(&self, relative: &str) -> bool {
        if !self.ctx.authorized(Topic::File, Action::FileRemove) {
            return true;
        }
        let Some(target) = self.resolve(relative) else {
            self.publish_denied(relative, &FileDenied::BadPath);
            return true;
        };
        match tokio::fs::remove_file(&target).await {
            Ok(()) => self.untrack(&target),
            Err(err) => {
                debug!("file: remove {} failed: {}", target.display(), err);
                let event = QueuedPublish::new(self.event_topic(relative), Vec::new())
                    .bridge_error("file-remove");
                self.ctx.publish(event);
            }
        }
        true
    }

    // ── From MCU ──────────────────────────────────────────────

    /// Dispatch one MCU file command. Status delivery (ACK on success,
    /// ERROR/MALFORMED otherwise) happens here, so the bridge dispatcher
    /// must not pre-ACK file commands.
    pub fn on_mcu_frame(&self, command: Command, payload: Vec<u8>) {
        let service = FileWorker {
            ctx: self.ctx.clone(),
            tracked: self.tracked.clone(),
            root: self.ctx.config.file_system_root.clone(),
            write_max: self.ctx.config.file_write_max_bytes,
            quota: self.ctx.config.file_storage_quota_bytes,
        };
        self.ctx.schedule_background(async move {
            service.run(command, payload).await;
        });
    }
}

/// Owned worker for MCU-side file operations, detached from the service
/// borrow so it can run in the background.
struct FileWorker {
    ctx: Arc<BridgeContext>,
    tracked: Arc<Mutex<HashMap<PathBuf, u64>>>,
    root: String,
    write_max: usize,
    quota: u64,
}

impl FileWorker {
    async fn run(&self, command: Command, payload: Vec<u8>) {
        let outcome = match command {
            Command::FileWrite => self.write(&payload).await,
            Command::FileRead => self.read(&payload).await,
            Command::FileRemove => self.remove(&payload).await,
            _ => Err(Status::Unsupported),
        };
        match outcome {
            Ok(()) => self.ctx.ack_mcu(command).await,
            Err(status) => self.ctx.fail_mcu(command, status).await,
        }
    }

    fn resolve(&self, relative: &str) -> Option<PathBuf> {
        if relative.is_empty() {
            return None;
        }
        let path = Path::new(relative);
        if path.is_absolute()
            || path
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }
        Some(Path::new(&self.root).join(path))
    }

    /// `u8 path_len, path, u16 data_len (BE), data`.
    async fn write(&self, payload: &[u8]) -> Result<(), Status> {
        let (path, rest) = parse_path(payload).ok_or(Status::Malformed)?;
        if rest.len() < 2 {
            return Err(Status::Malformed);
        }
        let declared = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        let data = &rest[2..];
        if data.len() != declared {
            return Err(Status::Malformed);
        }

        let target = self.resolve(&path).ok_or(Status::Error)?;
        if data.len() > self.write_max {
            return Err(Status::Error);
        }
        {
            let tracked = self.tracked.lock().unwrap();
            let existing = tracked.get(&target).copied().unwrap_or(0);
            if tracked.values().sum::<u64>() - existing + data.len() as u64 > self.quota {
                return Err(Status::Error);
            }
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|_| Status::Error)?;
        }
        tokio::fs::write(&target, data)
            .await
            .map_err(|_| Status::Error)?;
        self.tracked
            .lock()
            .unwrap()
            .insert(target, data.len() as u64);
        Ok(())
    }

    /// `u8 path_len, path` → chunked `CMD_FILE_READ_RESP` frames, each
    /// `[flags, data...]` with the last chunk flagged.
    async fn read(&self, payload: &[u8]) -> Result<(), Status> {
        let (path, _) = parse_path(payload).ok_or(Status::Malformed)?;
        let target = self.resolve(&path).ok_or(Status::Error)?;
        let content = tokio::fs::read(&target).await.map_err(|_| Status::Error)?;

        let chunk_size = MAX_PAYLOAD_SIZE - 1;
        let chunks: Vec<&[u8]> = if content.is_empty() {
            vec![&[]]
        } else {
            content.chunks(chunk_size).collect()
        };
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.iter().enumerate() {
            let mut body = Vec::with_capacity(1 + chunk.len());
            body.push(if i == last { CHUNK_FLAG_LAST } else { 0 });
            body.extend_from_slice(chunk);
            self.ctx.respond_mcu(Command::FileReadResp, &body).await;
        }
        Ok(())
    }

    /// `u8 path_len, path`.
    async fn remove(&self, payload: &[u8]) -> Result<(), Status> {
        let (path, _) = parse_path(payload).ok_or(Status::Malformed)?;
        let target = self.resolve(&path).ok_or(Status::Error)?;
        tokio::fs::remove_file(&target)
            .await
            .map_err(|_| Status::Error)?;
        self.tracked.lock().unwrap().remove(&target);
        Ok(())
    }
}

fn parse_path(payload: &[u8]) -> Option<(String, &[u8])> {
    let (&len, rest) = payload.split_first()?;
    let len = len as usize;
    if rest.len() < len {
        return None;
    }
    let (path, rest) = rest.split_at(len);
    Some((String::from_utf8(path.to_vec()).ok()?, rest))
}

#[async_trait]
impl TopicHandler for FileService {
    async fn handle(&self, route: &RouteMatch, message: &InboundMessage) -> bool {
        match route.segment(0) {
            Some("write") => self.handle_write(&route.tail(1), message).await,
            Some("read") => {
                // `file/read/response/...` is where we publish.
                if route.segment(1) == Some("response") {
                    return true;
                }
                self.handle_read(&route.tail(1), message).await
            }
            Some("remove") => self.handle_remove(&route.tail(1)).await,
            _ => false,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
