//! Shared runtime state — the single substrate every component reads and
//! writes.
//!
//! Constructed once at boot and passed around as `Arc<RuntimeState>`.
//! Mutations happen on the single-threaded runtime; short `std::sync::Mutex`
//! critical sections guard each section and are never held across an await.
//! Bounded queues never block the producer: an enqueue either fits or sheds
//! load immediately (drop-from-front or reject, depending on the queue).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use log::{debug, warn};
use tokio::sync::Notify;

use crate::config::BridgeConfig;
use crate::mqtt::messages::QueuedPublish;
use crate::mqtt::spool::MqttSpool;

// ── Bounded queue ────────────────────────────────────────────

/// Byte accounting hook for bounded queues.
pub trait ByteSized {
    fn byte_len(&self) -> usize;
}

impl ByteSized for Vec<u8> {
    fn byte_len(&self) -> usize {
        self.len()
    }
}

impl ByteSized for QueuedPublish {
    fn byte_len(&self) -> usize {
        self.topic.len() + self.payload.len()
    }
}

/// FIFO bounded by item count and (optionally) total bytes.
///
/// Two overflow policies:
/// - [`push_drop_oldest`](Self::push_drop_oldest) always admits the new item
///   and sheds from the front until the caps hold again;
/// - [`try_push`](Self::try_push) rejects the new item when it would not fit.
///
/// Either way the producer never blocks and `dropped()` counts every shed
/// or rejected item.
pub struct BoundedQueue<T: ByteSized> {
    name: &'static str,
    items: VecDeque<T>,
    max_items: usize,
    max_bytes: usize,
    bytes: usize,
    dropped: u64,
}

impl<T: ByteSized> BoundedQueue<T> {
    /// `max_bytes = 0` disables byte accounting.
    pub fn new(name: &'static str, max_items: usize, max_bytes: usize) -> Self {
        Self {
            name,
            items: VecDeque::new(),
            max_items,
            max_bytes,
            bytes: 0,
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn fits(&self, extra: usize) -> bool {
        self.items.len() < self.max_items && (self.max_bytes == 0 || self.bytes + extra <= self.max_bytes)
    }

    /// Admit `item`, shedding from the front until the caps hold.
    /// Returns `true` when nothing was shed.
    pub fn push_drop_oldest(&mut self, item: T) -> bool {
        let size = item.byte_len();
        self.bytes += size;
        self.items.push_back(item);

        let mut shed = 0u64;
        while self.items.len() > self.max_items
            || (self.max_bytes != 0 && self.bytes > self.max_bytes)
        {
            match self.items.pop_front() {
                Some(old) => {
                    self.bytes -= old.byte_len();
                    shed += 1;
                }
                None => break,
            }
        }
        if shed > 0 {
            self.dropped += shed;
            warn!("{}: queue overflow, dropped {} oldest", self.name, shed);
        }
        shed == 0
    }

    /// Admit `item` only if it fits; otherwise count a drop and return false.
    pub fn try_push(&mut self, item: T) -> bool {
        if self.fits(item.byte_len()) {
            self.bytes += item.byte_len();
            self.items.push_back(item);
            true
        } else {
            self.dropped += 1;
            false
        }
    }

    /// Put `item` back at the front without byte-accounting drift.
    /// Used by consumers whose delivery failed.
    pub fn push_front(&mut self, item: T) {
        self.bytes += item.byte_len();
        self.items.push_front(item);
    }

    pub fn pop_front(&mut self) -> Option<T> {
        let item = self.items.pop_front()?;
        self.bytes -= item.byte_len();
        Some(item)
    }

    pub fn drain_all(&mut self) -> Vec<T> {
        self.bytes = 0;
        self.items.drain(..).collect()
    }
}

// ── Pending pin reads ────────────────────────────────────────

/// Where a pin-read answer goes once the MCU responds.
#[derive(Debug, Clone)]
pub enum ReplyContext {
    /// Publish on the pin's `/value` topic, echoing request/response
    /// correlation when the client supplied it.
    Mqtt {
        value_topic: String,
        response_topic: Option<String>,
        correlation: Option<Vec<u8>>,
    },
    /// Answer over the serial link (MCU-originated read).
    Serial,
}

#[derive(Debug, Clone)]
pub struct PendingPinRequest {
    pub pin: u8,
    pub reply: ReplyContext,
}

// ── Process table ────────────────────────────────────────────

/// Managed host process lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessFsm {
    Starting,
    Running,
    Finished,
    Reaped,
}

/// One host process spawned on behalf of the MCU or an MQTT client.
pub struct ManagedProcess {
    pub pid: u16,
    pub command: String,
    pub state: ProcessFsm,
    pub stdout_buffer: Vec<u8>,
    pub stderr_buffer: Vec<u8>,
    pub stdout_dropped: u64,
    pub stderr_dropped: u64,
    pub exit_code: Option<i32>,
    /// OS pid for group kill; None once the child is gone.
    pub os_pid: Option<u32>,
}

// ── MCU capabilities ─────────────────────────────────────────

/// Capability record announced by the MCU after a handshake.
#[derive(Debug, Clone, Default)]
pub struct McuCapabilities {
    pub protocol_version: u8,
    pub board_arch: String,
    pub num_digital_pins: u8,
    pub num_analog_inputs: u8,
    pub feature_bits: u16,
}

// ── Supervisor health ────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct TaskHealth {
    pub restarts: u32,
    pub last_error: Option<String>,
    pub backoff_secs: f64,
    pub fatal: bool,
}

// ── Serial flow metrics ──────────────────────────────────────

/// Outcome counters for the flow controller.
#[derive(Default)]
pub struct FlowStats {
    pub sent: AtomicU64,
    pub acked: AtomicU64,
    pub retries: AtomicU64,
    pub failures: AtomicU64,
    pub timeouts: AtomicU64,
    pub cancelled: AtomicU64,
    /// Unix seconds of the most recent flow event.
    pub last_event_unix: AtomicU64,
}

/// Frame-level error counters maintained by the serial transport.
#[derive(Default)]
pub struct SerialErrorStats {
    pub crc_errors: AtomicU64,
    pub decode_errors: AtomicU64,
    pub oversize_packets: AtomicU64,
    pub unexpected_status: AtomicU64,
}

/// Fixed-bucket latency histogram for command round-trips (milliseconds).
pub struct LatencyHistogram {
    counts: [u64; Self::BUCKETS.len() + 1],
}

impl LatencyHistogram {
    pub const BUCKETS: [u64; 8] = [5, 10, 25, 50, 100, 250, 500, 1000];

    pub fn new() -> Self {
        Self {
            counts: [0; Self::BUCKETS.len() + 1],
        }
    }

    pub fn observe(&mut self, latency: Duration) {
        let ms = latency.as_millis() as u64;
        let idx = Self::BUCKETS
            .iter()
            .position(|&b| ms <= b)
            .unwrap_or(Self::BUCKETS.len());
        self.counts[idx] += 1;
    }

    /// `(upper_bound_label, count)` pairs; the last bucket is `+inf`.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut out = Vec::with_capacity(self.counts.len());
        for (i, &count) in self.counts.iter().enumerate() {
            let label = if i < Self::BUCKETS.len() {
                format!("le_{}ms", Self::BUCKETS[i])
            } else {
                "le_inf".to_string()
            };
            out.push((label, count));
        }
        out
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

// ── Handshake stats ──────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct HandshakeStats {
    pub attempts: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub last_failure: Option<String>,
    pub last_success_unix: Option<u64>,
    pub replay_counter: u64,
}

// ── Runtime state ────────────────────────────────────────────

/// The shared substrate (spec: one value threaded through the bridge
/// context, never module-level globals).
pub struct RuntimeState {
    // Outbound MQTT
    pub mqtt_queue: Mutex<BoundedQueue<QueuedPublish>>,
    pub mqtt_notify: Notify,
    pub spool: MqttSpool,
    pub mqtt_published: AtomicU64,
    pub mqtt_requeued: AtomicU64,

    // Mailbox
    pub mailbox_outgoing: Mutex<BoundedQueue<Vec<u8>>>,
    pub mailbox_incoming: Mutex<BoundedQueue<Vec<u8>>>,

    // Console
    pub console_queue: Mutex<BoundedQueue<Vec<u8>>>,

    // Pending pin reads
    pub pending_digital: Mutex<VecDeque<PendingPinRequest>>,
    pub pending_analog: Mutex<VecDeque<PendingPinRequest>>,
    pub pending_pin_limit: usize,

    // Datastore (volatile)
    pub datastore: Mutex<HashMap<String, Vec<u8>>>,

    // Host processes
    pub processes: Mutex<HashMap<u16, ManagedProcess>>,

    // Link state
    pub serial_synced: AtomicBool,
    pub mcu_paused: AtomicBool,
    pub capabilities: Mutex<Option<McuCapabilities>>,

    // Metrics
    pub flow: FlowStats,
    pub serial_errors: SerialErrorStats,
    pub latency: Mutex<LatencyHistogram>,
    pub serial_bytes_in: AtomicU64,
    pub serial_bytes_out: AtomicU64,
    pub supervisor: Mutex<HashMap<String, TaskHealth>>,
    pub handshake: Mutex<HandshakeStats>,

    started_at: Instant,
}

impl RuntimeState {
    pub fn new(config: &BridgeConfig, spool: MqttSpool) -> Self {
        Self {
            mqtt_queue: Mutex::new(BoundedQueue::new(
                "mqtt-out",
                config.mqtt_queue_limit,
                0,
            )),
            mqtt_notify: Notify::new(),
            spool,
            mqtt_published: AtomicU64::new(0),
            mqtt_requeued: AtomicU64::new(0),

            mailbox_outgoing: Mutex::new(BoundedQueue::new(
                "mailbox-out",
                config.mailbox_queue_limit,
                config.mailbox_queue_bytes_limit,
            )),
            mailbox_incoming: Mutex::new(BoundedQueue::new(
                "mailbox-in",
                config.mailbox_queue_limit,
                config.mailbox_queue_bytes_limit,
            )),

            console_queue: Mutex::new(BoundedQueue::new(
                "console",
                usize::MAX,
                config.console_queue_limit_bytes,
            )),

            pending_digital: Mutex::new(VecDeque::new()),
            pending_analog: Mutex::new(VecDeque::new()),
            pending_pin_limit: config.pending_pin_request_limit,

            datastore: Mutex::new(HashMap::new()),
            processes: Mutex::new(HashMap::new()),

            serial_synced: AtomicBool::new(false),
            mcu_paused: AtomicBool::new(false),
            capabilities: Mutex::new(None),

            flow: FlowStats::default(),
            serial_errors: SerialErrorStats::default(),
            latency: Mutex::new(LatencyHistogram::new()),
            serial_bytes_in: AtomicU64::new(0),
            serial_bytes_out: AtomicU64::new(0),
            supervisor: Mutex::new(HashMap::new()),
            handshake: Mutex::new(HandshakeStats::default()),

            started_at: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Enqueue an outbound MQTT publish. A saturated queue overflows into
    /// the persistent spool; the producer never blocks either way.
    pub fn enqueue_mqtt(&self, message: QueuedPublish) -> bool {
        let fitted = {
            let mut queue = self.mqtt_queue.lock().unwrap();
            queue.try_push(message.clone())
        };
        if fitted {
            self.mqtt_notify.notify_one();
            return true;
        }

        debug!("mqtt-out saturated, spooling {}", message.topic);
        self.spool.append(&message)
    }

    /// Record one supervised-task failure.
    pub fn record_supervisor_failure(
        &self,
        name: &str,
        backoff: Duration,
        error: &str,
        fatal: bool,
    ) {
        let mut table = self.supervisor.lock().unwrap();
        let entry = table.entry(name.to_string()).or_default();
        entry.restarts += 1;
        entry.last_error = Some(error.to_string());
        entry.backoff_secs = backoff.as_secs_f64();
        entry.fatal = fatal;
    }

    /// Reset a task's backoff bookkeeping after a healthy run.
    pub fn mark_supervisor_healthy(&self, name: &str) {
        let mut table = self.supervisor.lock().unwrap();
        let entry = table.entry(name.to_string()).or_default();
        entry.backoff_secs = 0.0;
        entry.last_error = None;
    }

    /// Record a terminal flow-controller event for metrics.
    pub fn record_flow_event(
        &self,
        event: &str,
        command_id: u16,
        status_name: &str,
        attempts: u32,
    ) {
        debug!(
            "flow event={} command={:#06x} status={} attempts={}",
            event, command_id, status_name, attempts
        );
        self.flow
            .last_event_unix
            .store(unix_now(), Ordering::Relaxed);
    }

    pub fn observe_latency(&self, latency: Duration) {
        self.latency.lock().unwrap().observe(latency);
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ── Tests ────────────────────────────────────────────────────
