//! Host process execution on behalf of the MCU and MQTT clients.
//!
//! Spawns go through the shell, capped by a concurrency semaphore sized to
//! `process_max_concurrent`; a rejected spawn reports
//! [`INVALID_ID_SENTINEL`] instead of a pid. Stdout/stderr accumulate into
//! bounded buffers; `collect_output` drains one batch at a time (stdout
//! before stderr, batch capped to one response frame). Once a process has
//! exited and both buffers are drained the slot is reaped and the
//! semaphore permit released. Kill signals the whole process group;
//! already-gone processes are not an error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::AsyncReadExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::mqtt::messages::QueuedPublish;
use crate::router::{Action, InboundMessage, RouteMatch, Topic, TopicHandler};
use crate::rpc::protocol::{Command, INVALID_ID_SENTINEL, MAX_PAYLOAD_SIZE};
use crate::state::{ManagedProcess, ProcessFsm};

use super::BridgeContext;

/// `CMD_PROCESS_POLL_RESP` header: running, exit_code, stdout_len.
const POLL_HEADER_OVERHEAD: usize = 3;

/// Exit codes reported for spawns that never ran.
const EXIT_DENIED: u8 = 126;
const EXIT_BUSY: u8 = 125;
const EXIT_TIMEOUT: u8 = 124;

#[derive(Debug)]
pub enum SpawnDenied {
    NotAllowed,
    Busy,
    Io(std::io::Error),
}

/// One drained output batch.
pub struct OutputBatch {
    pub running: bool,
    pub exit_code: u8,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

pub struct ProcessService {
    ctx: Arc<BridgeContext>,
    semaphore: Arc<Semaphore>,
    next_pid: Mutex<u16>,
    permits: Arc<Mutex<HashMap<u16, OwnedSemaphorePermit>>>,
}

impl ProcessService {
    pub fn new(ctx: Arc<BridgeContext>) -> Self {
        let slots = ctx.config.process_max_concurrent.max(1);
        Self {
            ctx,
            semaphore: Arc::new(Semaphore::new(slots)),
            next_pid: Mutex::new(1),
            permits: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn alloc_pid(&self) -> u16 {
        let table = self.ctx.state.processes.lock().unwrap();
        let mut next = self.next_pid.lock().unwrap();
        loop {
            let pid = *next;
            *next = next.wrapping_add(1);
            if pid == 0 || pid == INVALID_ID_SENTINEL || table.contains_key(&pid) {
                continue;
            }
            return pid;
        }
    }

    /// Spawn `command` through the shell. Returns the bridge-local pid.
    pub async fn spawn(&self, command: &str) -> Result<u16, SpawnDenied> {
        if !self.ctx.is_command_allowed(command) {
            return Err(SpawnDenied::NotAllowed);
        }
        let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
            return Err(SpawnDenied::Busy);
        };

        let mut builder = tokio::process::Command::new("sh");
        builder
            .arg("-c")
            .arg(command)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        #[cfg(unix)]
        builder.process_group(0);

        let mut child = builder.spawn().map_err(SpawnDenied::Io)?;
        let pid = self.alloc_pid();
        let os_pid = child.id();

        self.ctx.state.processes.lock().unwrap().insert(
            pid,
            ManagedProcess {
                pid,
                command: command.to_string(),
                state: ProcessFsm::Running,
                stdout_buffer: Vec::new(),
                stderr_buffer: Vec::new(),
                stdout_dropped: 0,
                stderr_dropped: 0,
                exit_code: None,
                os_pid,
            },
        );
        self.permits.lock().unwrap().insert(pid, permit);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let state = self.ctx.state.clone();
        let cap = self.ctx.config.process_max_output_bytes;
        self.ctx.schedule_background(async move {
            let out = pump_stream(stdout, state.clone(), pid, StreamKind::Stdout, cap);
            let err = pump_stream(stderr, state.clone(), pid, StreamKind::Stderr, cap);
            let (_, _, status) = tokio::join!(out, err, child.wait());

            let mut table = state.processes.lock().unwrap();
            if let Some(entry) = table.get_mut(&pid) {
                entry.exit_code = Some(match status {
                    Ok(s) => s.code().unwrap_or(-1),
                    Err(_) => -1,
                });
                entry.state = ProcessFsm::Finished;
                entry.os_pid = None;
            }
        });

        debug!("process: spawned pid {} ({})", pid, command);
        Ok(pid)
    }

    /// Drain one output batch. Stdout goes first; the whole batch fits one
    /// response frame. Reaps the slot once the process has exited and both
    /// buffers are empty.
    pub fn collect_output(&self, pid: u16) -> Option<OutputBatch> {
        let mut table = self.ctx.state.processes.lock().unwrap();
        let entry = table.get_mut(&pid)?;

        let budget = MAX_PAYLOAD_SIZE - POLL_HEADER_OVERHEAD;
        let take_out = entry.stdout_buffer.len().min(budget);
        let stdout: Vec<u8> = entry.stdout_buffer.drain(..take_out).collect();
        let take_err = entry.stderr_buffer.len().min(budget - stdout.len());
        let stderr: Vec<u8> = entry.stderr_buffer.drain(..take_err).collect();

        let finished = entry.state == ProcessFsm::Finished;
        let exit_code = entry.exit_code.unwrap_or(0).clamp(0, 255) as u8;
        let drained = entry.stdout_buffer.is_empty() && entry.stderr_buffer.is_empty();

        let batch = OutputBatch {
            running: !finished,
            exit_code,
            stdout,
            stderr,
        };

        if finished && drained {
            entry.state = ProcessFsm::Reaped;
            table.remove(&pid);
            drop(table);
            self.permits.lock().unwrap().remove(&pid);
            debug!("process: reaped pid {}", pid);
        }
        Some(batch)
    }

    /// Signal the whole process group; a process that is already gone is
    /// silently fine.
    pub async fn kill(&self, pid: u16) -> bool {
        let os_pid = {
            let table = self.ctx.state.processes.lock().unwrap();
            match table.get(&pid) {
                Some(entry) => entry.os_pid,
                None => return false,
            }
        };
        if let Some(os_pid) = os_pid {
            kill_group(os_pid);
        }
        true
    }

    /// Poll until the process finishes or the timeout elapses.
    pub async fn wait_exit(&self, pid: u16, timeout: Duration) -> Option<i32> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let table = self.ctx.state.processes.lock().unwrap();
                match table.get(&pid) {
                    Some(entry) if entry.state == ProcessFsm::Finished => {
                        return entry.exit_code;
                    }
                    Some(_) => {}
                    None => return None,
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    // ── From MCU ──────────────────────────────────────────────

    /// `CMD_PROCESS_RUN` / `CMD_PROCESS_RUN_ASYNC`, payload = command line.
    pub fn on_mcu_run(self: &Arc<Self>, command: Command, payload: Vec<u8>) {
        let service = self.clone();
        self.ctx.schedule_background(async move {
            let line = String::from_utf8_lossy(&payload).to_string();
            match command {
                Command::ProcessRunAsync => {
                    let pid = match service.spawn(&line).await {
                        Ok(pid) => pid,
                        Err(denied) => {
                            warn!("process: async spawn denied: {:?}", denied);
                            INVALID_ID_SENTINEL
                        }
                    };
                    service
                        .ctx
                        .respond_mcu(Command::ProcessRunAsyncResp, &pid.to_be_bytes())
                        .await;
                }
                Command::ProcessRun => {
                    let response = service.run_sync(&line).await;
                    service
                        .ctx
                        .respond_mcu(Command::ProcessRunResp, &response)
                        .await;
                }
                _ => {}
            }
        });
    }

    async fn run_sync(&self, line: &str) -> Vec<u8> {
        let timeout = Duration::from_secs_f64(self.ctx.config.process_timeout);
        let exit = match self.spawn(line).await {
            Ok(pid) => match self.wait_exit(pid, timeout).await {
                Some(code) => {
                    let batch = self.collect_output(pid);
                    let mut out = vec![code.clamp(0, 255) as u8];
                    if let Some(batch) = batch {
                        let budget = MAX_PAYLOAD_SIZE - 1;
                        out.extend_from_slice(
                            &batch.stdout[..batch.stdout.len().min(budget)],
                        );
                        let left = budget - (out.len() - 1);
                        out.extend_from_slice(&batch.stderr[..batch.stderr.len().min(left)]);
                    }
                    return out;
                }
                None => {
                    warn!("process: '{}' timed out, killing group", line);
                    self.kill(pid).await;
                    EXIT_TIMEOUT
                }
            },
            Err(SpawnDenied::NotAllowed) => EXIT_DENIED,
            Err(SpawnDenied::Busy) => EXIT_BUSY,
            Err(SpawnDenied::Io(err)) => {
                warn!("process: spawn failed: {}", err);
                EXIT_DENIED
            }
        };
        vec![exit]
    }

    /// `CMD_PROCESS_POLL`, payload = u16 pid.
    pub async fn on_mcu_poll(&self, payload: &[u8]) {
        let Some(pid) = parse_pid(payload) else {
            return;
        };
        let response = match self.collect_output(pid) {
            Some(batch) => {
                let mut out = Vec::with_capacity(
                    POLL_HEADER_OVERHEAD + batch.stdout.len() + batch.stderr.len(),
                );
                out.push(u8::from(batch.running));
                out.push(batch.exit_code);
                out.push(batch.stdout.len() as u8);
                out.extend_from_slice(&batch.stdout);
                out.extend_from_slice(&batch.stderr);
                out
            }
            None => vec![0, 0, 0],
        };
        self.ctx
            .respond_mcu(Command::ProcessPollResp, &response)
            .await;
    }

    /// `CMD_PROCESS_KILL`, payload = u16 pid.
    pub async fn on_mcu_kill(&self, payload: &[u8]) {
        if let Some(pid) = parse_pid(payload) {
            self.kill(pid).await;
        }
    }

    // ── From MQTT ─────────────────────────────────────────────

    async fn handle_run(&self, message: &InboundMessage) -> bool {
        if !self.ctx.authorized(Topic::Shell, Action::ShellRun) {
            return true;
        }
        let line = message.payload_str().to_string();
        let response = match self.spawn(&line).await {
            Ok(pid) => QueuedPublish::new(
                self.ctx.topic("sh/response"),
                pid.to_string().into_bytes(),
            ),
            Err(denied) => {
                let kind = match denied {
                    SpawnDenied::NotAllowed => "command-not-allowed",
                    SpawnDenied::Busy => "process-busy",
                    SpawnDenied::Io(_) => "spawn-failed",
                };
                QueuedPublish::new(
                    self.ctx.topic("sh/response"),
                    INVALID_ID_SENTINEL.to_string().into_bytes(),
                )
                .bridge_error(kind)
            }
        };
        self.ctx.publish(
            response.reply_to(message.response_topic.clone(), message.correlation.clone()),
        );
        true
    }

    async fn handle_poll(&self, pid: u16, message: &InboundMessage) -> bool {
        let Some(batch) = self.collect_output(pid) else {
            let event = QueuedPublish::new(self.ctx.topic("sh/response"), Vec::new())
                .user_property("bridge-pid", pid.to_string())
                .bridge_error("unknown-pid")
                .reply_to(message.response_topic.clone(), message.correlation.clone());
            self.ctx.publish(event);
            return true;
        };

        let mut payload = batch.stdout;
        payload.extend_from_slice(&batch.stderr);
        let mut response = QueuedPublish::new(self.ctx.topic("sh/response"), payload)
            .user_property("bridge-pid", pid.to_string())
            .user_property("bridge-running", batch.running.to_string());
        if !batch.running {
            response = response.user_property("bridge-exit", batch.exit_code.to_string());
        }
        self.ctx.publish(
            response.reply_to(message.response_topic.clone(), message.correlation.clone()),
        );
        true
    }

    async fn handle_kill(&self, pid: u16) -> bool {
        if !self.ctx.authorized(Topic::Shell, Action::ShellKill) {
            return true;
        }
        if !self.kill(pid).await {
            debug!("process: kill for unknown pid {}", pid);
        }
        true
    }
}

#[derive(Clone, Copy)]
enum StreamKind {
    Stdout,
    Stderr,
}

/// Pump one child pipe into its bounded buffer.
async fn pump_stream(
    stream: Option<impl tokio::io::AsyncRead + Unpin>,
    state: Arc<crate::state::RuntimeState>,
    pid: u16,
    kind: StreamKind,
    cap: usize,
) {
    let Some(mut stream) = stream else { return };
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut table = state.processes.lock().unwrap();
                let Some(entry) = table.get_mut(&pid) else { break };
                let (buffer, dropped) = match kind {
                    StreamKind::Stdout => (&mut entry.stdout_buffer, &mut entry.stdout_dropped),
                    StreamKind::Stderr => (&mut entry.stderr_buffer, &mut entry.stderr_dropped),
                };
                let room = cap.saturating_sub(buffer.len());
                let take = n.min(room);
                buffer.extend_from_slice(&buf[..take]);
                *dropped += (n - take) as u64;
            }
        }
    }
}

#[cfg(unix)]
fn kill_group(os_pid: u32) {
    // Negative pid addresses the process group created at spawn.
    // ESRCH (already gone) is deliberately ignored.
    unsafe {
        libc::killpg(os_pid as i32, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn kill_group(_os_pid: u32) {}

fn parse_pid(payload: &[u8]) -> Option<u16> {
    match payload {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

#[async_trait]
impl TopicHandler for ProcessService {
    async fn handle(&self, route: &RouteMatch, message: &InboundMessage) -> bool {
        match route.segment(0) {
            Some("run") => self.handle_run(message).await,
            Some("poll") => match route.segment(1).and_then(|s| s.parse().ok()) {
                Some(pid) => self.handle_poll(pid, message).await,
                None => false,
            },
            Some("kill") => match route.segment(1).and_then(|s| s.parse().ok()) {
                Some(pid) => self.handle_kill(pid).await,
                None => false,
            },
            // Our own publishes.
            Some("response") => true,
            _ => false,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
