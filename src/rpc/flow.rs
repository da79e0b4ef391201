//! Outbound command flow control.
//!
//! Serialises gateway→MCU commands: at most one pending command at any
//! time, ACK/response correlation, retries with exponential backoff, and a
//! terminal [`SendOutcome`] instead of exception-driven control flow.
//!
//! The transport's read task feeds every inbound frame through
//! [`FlowController::on_frame`]; frames it does not consume (ACKs,
//! responses, MCU log lines, stray statuses) belong to the ingress
//! dispatch.

use std::sync::{Arc, Mutex};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::state::RuntimeState;

use super::frame;
use super::protocol::{CMD_FLAG_COMPRESSED, CMD_ID_MASK, Command, Status};
use super::rle;
use super::wire;

/// Terminal result of one `send`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// ACK arrived; the payload is the `*_RESP` body for request commands.
    Success(Option<Vec<u8>>),
    /// The MCU answered with an explicit failure status.
    Failure(Status),
    /// Retries exhausted without an ACK (or without the response).
    Timeout,
    /// The gateway is shutting down; no retries were made.
    Cancelled,
}

/// Retry/timeout knobs, taken from config at boot.
#[derive(Debug, Clone)]
pub struct FlowTiming {
    pub ack_timeout: Duration,
    pub response_timeout: Duration,
    pub max_attempts: u32,
    /// Cap for the doubling ack backoff.
    pub backoff_cap: Duration,
}

impl Default for FlowTiming {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(750),
            response_timeout: Duration::from_secs(120),
            max_attempts: 3,
            backoff_cap: Duration::from_secs(6),
        }
    }
}

/// The single in-flight command.
struct Pending {
    command_id: u16,
    expected_response: Option<u16>,
    ack_received: bool,
    response: Option<Vec<u8>>,
    failure: Option<Status>,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct FlowController {
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    /// Strict send serialisation; queued senders run in await order.
    send_lock: tokio::sync::Mutex<()>,
    pending: Mutex<Option<Pending>>,
    signal: Notify,
    timing: FlowTiming,
    state: Arc<RuntimeState>,
    shutdown: CancellationToken,
    /// Poked on write failure so the transport reconnects.
    reconnect: Notify,
}

impl FlowController {
    pub fn new(timing: FlowTiming, state: Arc<RuntimeState>, shutdown: CancellationToken) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(None),
            send_lock: tokio::sync::Mutex::new(()),
            pending: Mutex::new(None),
            signal: Notify::new(),
            timing,
            state,
            shutdown,
            reconnect: Notify::new(),
        }
    }

    /// Install the write half of a freshly opened serial connection.
    pub async fn attach_writer(&self, writer: BoxedWriter) {
        *self.writer.lock().await = Some(writer);
    }

    /// Drop the writer on disconnect; in-flight waits will time out.
    pub async fn detach_writer(&self) {
        *self.writer.lock().await = None;
    }

    /// Resolves when a write failure wants a transport reconnect.
    pub async fn reconnect_requested(&self) {
        self.reconnect.notified().await;
    }

    /// Ask the transport to tear the connection down and redo the
    /// handshake (link reset, watchdog miss).
    pub fn request_reconnect(&self) {
        self.reconnect.notify_waiters();
    }

    /// Encode and write one frame (COBS + delimiter), bypassing the
    /// pending-command machinery. Used for ACK/RESP frames to the MCU and
    /// internally by `send`.
    pub async fn write_raw(&self, command_id: u16, payload: &[u8]) -> std::io::Result<()> {
        let raw = frame::build(command_id, payload)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
        let mut packet = wire::cobs_encode(&raw);
        packet.push(0);

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "serial link down")
        })?;
        writer.write_all(&packet).await?;
        writer.flush().await?;
        self.state
            .serial_bytes_out
            .fetch_add(packet.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Send one command and wait for its ACK (and response, if the command
    /// has a `*_RESP` pair). Retries with doubling backoff up to
    /// `max_attempts`, then reports `Timeout`.
    pub async fn send(&self, command: Command, payload: &[u8]) -> SendOutcome {
        let _serialised = self.send_lock.lock().await;

        if self.shutdown.is_cancelled() {
            self.state.flow.cancelled.fetch_add(1, Ordering::Relaxed);
            return SendOutcome::Cancelled;
        }

        let code = command as u16;
        let (wire_id, wire_payload) = compress_for_wire(code, payload);
        let expected = command.response().map(|r| r as u16);
        let started = Instant::now();

        self.state.flow.sent.fetch_add(1, Ordering::Relaxed);

        let mut backoff = self.timing.ack_timeout;
        for attempt in 1..=self.timing.max_attempts {
            if attempt > 1 {
                self.state.flow.retries.fetch_add(1, Ordering::Relaxed);
            }

            self.install_pending(code, expected);
            if let Err(err) = self.write_raw(wire_id, &wire_payload).await {
                self.clear_pending();
                warn!("flow: write failed for {}: {}", command.name(), err);
                self.state.flow.failures.fetch_add(1, Ordering::Relaxed);
                self.state
                    .record_flow_event("failure", code, "write-failed", attempt);
                self.reconnect.notify_waiters();
                return SendOutcome::Failure(Status::Error);
            }

            match self.wait_for_ack(backoff).await {
                Wait::Cancelled => return self.finish_cancelled(code, attempt),
                Wait::Failure(status) => return self.finish_failure(code, status, attempt),
                Wait::TimedOut => {
                    self.clear_pending();
                    debug!(
                        "flow: no ACK for {} (attempt {}/{})",
                        command.name(),
                        attempt,
                        self.timing.max_attempts
                    );
                    backoff = (backoff * 2).min(self.timing.backoff_cap);
                    continue;
                }
                Wait::Done => {}
            }

            self.state.flow.acked.fetch_add(1, Ordering::Relaxed);

            let Some(_resp_id) = expected else {
                self.clear_pending();
                self.state.observe_latency(started.elapsed());
                self.state.record_flow_event("success", code, "ACK", attempt);
                return SendOutcome::Success(None);
            };

            match self.wait_for_response(self.timing.response_timeout).await {
                Wait::Cancelled => return self.finish_cancelled(code, attempt),
                Wait::Failure(status) => return self.finish_failure(code, status, attempt),
                Wait::TimedOut => {
                    self.clear_pending();
                    debug!(
                        "flow: no response for {} (attempt {}/{})",
                        command.name(),
                        attempt,
                        self.timing.max_attempts
                    );
                    backoff = (backoff * 2).min(self.timing.backoff_cap);
                    continue;
                }
                Wait::Done => {
                    let payload = self.take_response();
                    self.clear_pending();
                    self.state.observe_latency(started.elapsed());
                    self.state.record_flow_event("success", code, "OK", attempt);
                    return SendOutcome::Success(Some(payload.unwrap_or_default()));
                }
            }
        }

        self.state.flow.timeouts.fetch_add(1, Ordering::Relaxed);
        self.state.record_flow_event(
            "timeout",
            code,
            Status::Timeout.name(),
            self.timing.max_attempts,
        );
        SendOutcome::Timeout
    }

    /// Offer one inbound frame (flag stripped, payload decompressed).
    /// Returns true when the frame belonged to the flow layer.
    pub fn on_frame(&self, command_id: u16, payload: &[u8]) -> bool {
        if Status::is_status_code(command_id) {
            self.on_status_frame(command_id, payload);
            return true;
        }

        // Response frame for the pending command?
        let mut guard = self.pending.lock().unwrap();
        if let Some(pending) = guard.as_mut() {
            if pending.expected_response == Some(command_id) {
                pending.response = Some(payload.to_vec());
                drop(guard);
                self.signal.notify_waiters();
                return true;
            }
        }
        false
    }

    fn on_status_frame(&self, command_id: u16, payload: &[u8]) {
        // MCU firmware logs arrive as printable status payloads; they must
        // never complete a pending command.
        if is_log_payload(payload) {
            debug!("mcu: {}", String::from_utf8_lossy(payload).trim_end());
            return;
        }

        let Some(status) = Status::from_u16(command_id) else {
            self.count_unexpected_status(command_id);
            return;
        };

        let mut guard = self.pending.lock().unwrap();
        let matched = match guard.as_mut() {
            Some(pending) if payload.len() == 2 => {
                let echoed = u16::from_be_bytes([payload[0], payload[1]]) & CMD_ID_MASK;
                if echoed == pending.command_id {
                    match status {
                        Status::Ack | Status::Ok => pending.ack_received = true,
                        failure => pending.failure = Some(failure),
                    }
                    true
                } else {
                    false
                }
            }
            _ => false,
        };
        drop(guard);

        if matched {
            self.signal.notify_waiters();
        } else {
            self.count_unexpected_status(command_id);
        }
    }

    fn count_unexpected_status(&self, command_id: u16) {
        debug!("flow: unexpected status frame {:#06x}", command_id);
        self.state
            .serial_errors
            .unexpected_status
            .fetch_add(1, Ordering::Relaxed);
    }

    // ── Pending-state helpers ─────────────────────────────────

    fn install_pending(&self, command_id: u16, expected_response: Option<u16>) {
        *self.pending.lock().unwrap() = Some(Pending {
            command_id,
            expected_response,
            ack_received: false,
            response: None,
            failure: None,
        });
    }

    fn clear_pending(&self) {
        *self.pending.lock().unwrap() = None;
    }

    fn take_response(&self) -> Option<Vec<u8>> {
        self.pending
            .lock()
            .unwrap()
            .as_mut()
            .and_then(|p| p.response.take())
    }

    async fn wait_for_ack(&self, timeout: Duration) -> Wait {
        self.wait_until(timeout, |p| {
            if let Some(status) = p.failure {
                Some(Wait::Failure(status))
            } else if p.ack_received {
                Some(Wait::Done)
            } else {
                None
            }
        })
        .await
    }

    async fn wait_for_response(&self, timeout: Duration) -> Wait {
        self.wait_until(timeout, |p| {
            if let Some(status) = p.failure {
                Some(Wait::Failure(status))
            } else if p.response.is_some() {
                Some(Wait::Done)
            } else {
                None
            }
        })
        .await
    }

    async fn wait_until(
        &self,
        timeout: Duration,
        check: impl Fn(&Pending) -> Option<Wait>,
    ) -> Wait {
        let deadline = Instant::now() + timeout;
        loop {
            // Arm the notification before inspecting state so a signal
            // between the check and the await is not lost.
            let notified = self.signal.notified();

            if let Some(verdict) = self
                .pending
                .lock()
                .unwrap()
                .as_ref()
                .and_then(&check)
            {
                return verdict;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Wait::TimedOut;
            }

            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep(remaining) => {}
                () = self.shutdown.cancelled() => return Wait::Cancelled,
            }
        }
    }

    fn finish_cancelled(&self, code: u16, attempt: u32) -> SendOutcome {
        self.clear_pending();
        self.state.flow.cancelled.fetch_add(1, Ordering::Relaxed);
        self.state
            .record_flow_event("cancelled", code, "CANCELLED", attempt);
        SendOutcome::Cancelled
    }

    fn finish_failure(&self, code: u16, status: Status, attempt: u32) -> SendOutcome {
        self.clear_pending();
        self.state.flow.failures.fetch_add(1, Ordering::Relaxed);
        self.state
            .record_flow_event("failure", code, status.name(), attempt);
        SendOutcome::Failure(status)
    }
}

enum Wait {
    Done,
    Failure(Status),
    TimedOut,
    Cancelled,
}

/// Compress the payload when the heuristic approves and the encoding
/// actually shrinks it; sets the compression flag accordingly.
fn compress_for_wire(code: u16, payload: &[u8]) -> (u16, Vec<u8>) {
    if rle::should_compress(payload) {
        let encoded = rle::encode(payload);
        if encoded.len() < payload.len() {
            return (code | CMD_FLAG_COMPRESSED, encoded);
        }
    }
    (code, payload.to_vec())
}

/// Conservative printable-ASCII rule for MCU log frames: every byte in
/// `[0x20, 0x7E]` or one of tab/CR/LF, and at least one byte.
fn is_log_payload(payload: &[u8]) -> bool {
    !payload.is_empty()
        && payload
            .iter()
            .all(|&b| (0x20..=0x7E).contains(&b) || b == b'\t' || b == b'\r' || b == b'\n')
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::mqtt::spool::MqttSpool;
    use crate::rpc::protocol::MAX_SERIAL_PACKET_BYTES;

    fn test_state() -> Arc<RuntimeState> {
        let dir = tempfile::tempdir().unwrap();
        let spool = MqttSpool::open(dir.path().to_str().unwrap(), 10).unwrap();
        let config = BridgeConfig::default();
        Arc::new(RuntimeState::new(&config, spool))
    }

    fn fast_timing() -> FlowTiming {
        FlowTiming {
            ack_timeout: Duration::from_millis(30),
            response_timeout: Duration::from_millis(100),
            max_attempts: 3,
            backoff_cap: Duration::from_millis(120),
        }
    }

    async fn flow_with_writer() -> (Arc<FlowController>, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(4096);
        let flow = Arc::new(FlowController::new(
            fast_timing(),
            test_state(),
            CancellationToken::new(),
        ));
        flow.attach_writer(Box::new(ours)).await;
        (flow, theirs)
    }

    /// Read one COBS packet off the fake-MCU side and parse it.
    async fn read_frame(side: &mut tokio::io::DuplexStream) -> (u16, Vec<u8>) {
        use tokio::io::AsyncReadExt;
        let mut packet = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            side.read_exact(&mut byte).await.unwrap();
            if byte[0] == 0 {
                break;
            }
            packet.push(byte[0]);
            assert!(packet.len() <= MAX_SERIAL_PACKET_BYTES);
        }
        let raw = wire::cobs_decode(&packet).unwrap();
        frame::parse(&raw).unwrap()
    }

    fn ack_for(cmd: Command) -> (u16, Vec<u8>) {
        (Status::Ack as u16, (cmd as u16).to_be_bytes().to_vec())
    }

    #[tokio::test]
    async fn ack_only_command_succeeds() {
        let (flow, mut mcu) = flow_with_writer().await;

        let sender = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.send(Command::DigitalWrite, &[13, 1]).await })
        };

        let (cmd, payload) = read_frame(&mut mcu).await;
        assert_eq!(cmd, Command::DigitalWrite as u16);
        assert_eq!(payload, vec![13, 1]);

        let (status, ack_payload) = ack_for(Command::DigitalWrite);
        assert!(flow.on_frame(status, &ack_payload));

        assert_eq!(sender.await.unwrap(), SendOutcome::Success(None));
    }

    #[tokio::test]
    async fn request_command_returns_response_payload() {
        let (flow, mut mcu) = flow_with_writer().await;

        let sender = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.send(Command::DigitalRead, &[13]).await })
        };

        let _ = read_frame(&mut mcu).await;
        let (status, ack_payload) = ack_for(Command::DigitalRead);
        flow.on_frame(status, &ack_payload);
        flow.on_frame(Command::DigitalReadResp as u16, &[13, 1]);

        assert_eq!(
            sender.await.unwrap(),
            SendOutcome::Success(Some(vec![13, 1]))
        );
    }

    #[tokio::test]
    async fn retries_then_times_out() {
        let (flow, mut mcu) = flow_with_writer().await;

        let sender = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.send(Command::DigitalWrite, &[1, 0]).await })
        };

        // Three attempts hit the wire, none acked.
        for _ in 0..3 {
            let (cmd, _) = read_frame(&mut mcu).await;
            assert_eq!(cmd, Command::DigitalWrite as u16);
        }

        assert_eq!(sender.await.unwrap(), SendOutcome::Timeout);
        assert_eq!(flow.state.flow.retries.load(Ordering::Relaxed), 2);
        assert_eq!(flow.state.flow.timeouts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn failure_status_ends_send() {
        let (flow, mut mcu) = flow_with_writer().await;

        let sender = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.send(Command::FileRemove, b"x").await })
        };

        let _ = read_frame(&mut mcu).await;
        flow.on_frame(
            Status::Error as u16,
            &(Command::FileRemove as u16).to_be_bytes(),
        );

        assert_eq!(sender.await.unwrap(), SendOutcome::Failure(Status::Error));
    }

    #[tokio::test]
    async fn ack_for_other_command_is_ignored() {
        let (flow, mut mcu) = flow_with_writer().await;

        let sender = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.send(Command::DigitalWrite, &[2, 1]).await })
        };

        let _ = read_frame(&mut mcu).await;
        // ACK for a different command: ignored, send still times out.
        flow.on_frame(
            Status::Ack as u16,
            &(Command::AnalogWrite as u16).to_be_bytes(),
        );
        for _ in 0..2 {
            let _ = read_frame(&mut mcu).await;
        }
        assert_eq!(sender.await.unwrap(), SendOutcome::Timeout);
    }

    #[tokio::test]
    async fn printable_status_payload_is_a_log_line() {
        let (flow, mut mcu) = flow_with_writer().await;

        let sender = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.send(Command::DigitalWrite, &[2, 1]).await })
        };

        let _ = read_frame(&mut mcu).await;
        // A debug print from the MCU must not end the pending command...
        assert!(flow.on_frame(Status::Error as u16, b"sensor init OK\r\n"));
        // ...but the real ACK does.
        let (status, ack) = ack_for(Command::DigitalWrite);
        flow.on_frame(status, &ack);
        assert_eq!(sender.await.unwrap(), SendOutcome::Success(None));
    }

    #[tokio::test]
    async fn stray_status_is_counted_and_dropped() {
        let (flow, _mcu) = flow_with_writer().await;
        assert!(flow.on_frame(Status::Ack as u16, &[0x00, 0x51]));
        assert_eq!(
            flow.state
                .serial_errors
                .unexpected_status
                .load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn large_repetitive_payload_is_compressed() {
        let (flow, mut mcu) = flow_with_writer().await;

        let payload = vec![b'A'; 20];
        let sender = {
            let flow = flow.clone();
            let payload = payload.clone();
            tokio::spawn(async move { flow.send(Command::ConsoleWrite, &payload).await })
        };

        let (cmd, wire_payload) = read_frame(&mut mcu).await;
        assert_eq!(cmd & CMD_FLAG_COMPRESSED, CMD_FLAG_COMPRESSED);
        assert_eq!(cmd & CMD_ID_MASK, Command::ConsoleWrite as u16);
        assert!(wire_payload.len() < 20);
        assert_eq!(rle::decode(&wire_payload).unwrap(), payload);

        let (status, ack) = ack_for(Command::ConsoleWrite);
        flow.on_frame(status, &ack);
        assert_eq!(sender.await.unwrap(), SendOutcome::Success(None));
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_send() {
        let (ours, _theirs) = tokio::io::duplex(4096);
        let token = CancellationToken::new();
        let flow = Arc::new(FlowController::new(
            FlowTiming {
                ack_timeout: Duration::from_secs(30),
                ..fast_timing()
            },
            test_state(),
            token.clone(),
        ));
        flow.attach_writer(Box::new(ours)).await;

        let sender = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.send(Command::DigitalWrite, &[1, 1]).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        assert_eq!(sender.await.unwrap(), SendOutcome::Cancelled);
    }

    #[tokio::test]
    async fn write_failure_reports_failure() {
        let flow = Arc::new(FlowController::new(
            fast_timing(),
            test_state(),
            CancellationToken::new(),
        ));
        // No writer attached: the link is down.
        let outcome = flow.send(Command::DigitalWrite, &[1, 1]).await;
        assert_eq!(outcome, SendOutcome::Failure(Status::Error));
    }

    #[test]
    fn log_payload_rule() {
        assert!(is_log_payload(b"boot: bridge v2 ready\r\n"));
        assert!(is_log_payload(b"tab\there"));
        assert!(!is_log_payload(b""));
        assert!(!is_log_payload(&[0x00, 0x51]));
        assert!(!is_log_payload(&[0x13, 0x37]));
    }
}
