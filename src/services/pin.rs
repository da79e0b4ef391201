//! Digital/analog pin I/O.
//!
//! Writes forward straight to the MCU. Reads are two-phase: the request is
//! queued as a [`PendingPinRequest`] (FIFO per kind, bounded), the read
//! command goes out, and the MCU's `*_READ_RESP` answers the oldest queued
//! request. A per-kind lock keeps the wire order of read commands equal to
//! the queue order, so head-of-queue matching is sound.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};

use crate::mqtt::messages::QueuedPublish;
use crate::router::{Action, InboundMessage, RouteMatch, Topic, TopicHandler};
use crate::rpc::flow::SendOutcome;
use crate::rpc::protocol::Command;
use crate::state::{PendingPinRequest, ReplyContext};

use super::BridgeContext;

/// Pin kind, folding the digital/analog split into one code path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PinKind {
    Digital,
    Analog,
}

/// Per-kind read serialisation, shared with the spawned read tasks.
struct ReadLocks {
    digital: tokio::sync::Mutex<()>,
    analog: tokio::sync::Mutex<()>,
}

pub struct PinService {
    ctx: Arc<BridgeContext>,
    read_locks: Arc<ReadLocks>,
}

impl PinService {
    pub fn new(ctx: Arc<BridgeContext>) -> Self {
        Self {
            ctx,
            read_locks: Arc::new(ReadLocks {
                digital: tokio::sync::Mutex::new(()),
                analog: tokio::sync::Mutex::new(()),
            }),
        }
    }

    // ── MQTT side ─────────────────────────────────────────────

    async fn handle_write(&self, kind: PinKind, pin: u8, message: &InboundMessage) -> bool {
        if !self.ctx.authorized(topic_of(kind), Action::PinWrite) {
            return true;
        }
        if !self.pin_in_range(kind, pin) {
            self.publish_pin_error(kind, pin, "invalid-pin");
            return true;
        }
        let Some(value) = parse_value(&message.payload_str()) else {
            self.publish_pin_error(kind, pin, "bad-value");
            return true;
        };

        let command = match kind {
            PinKind::Digital => Command::DigitalWrite,
            PinKind::Analog => Command::AnalogWrite,
        };
        let payload = [pin, (value & 0xFF) as u8];
        let ctx = self.ctx.clone();
        self.ctx.schedule_background(async move {
            if ctx.send_frame(command, &payload).await != SendOutcome::Success(None) {
                warn!("pin: {} to pin {} failed", command.name(), pin);
            }
        });
        true
    }

    async fn handle_read(&self, kind: PinKind, pin: u8, message: &InboundMessage) -> bool {
        if !self.ctx.authorized(topic_of(kind), Action::PinRead) {
            return true;
        }
        if !self.pin_in_range(kind, pin) {
            self.publish_pin_error(kind, pin, "invalid-pin");
            return true;
        }

        let request = PendingPinRequest {
            pin,
            reply: ReplyContext::Mqtt {
                value_topic: self.value_topic(kind, pin),
                response_topic: message.response_topic.clone(),
                correlation: message.correlation.clone(),
            },
        };

        // Bounded FIFO: reject the request outright past the limit.
        {
            let mut queue = pending_of(&self.ctx, kind).lock().unwrap();
            if queue.len() >= self.ctx.state.pending_pin_limit {
                drop(queue);
                warn!(
                    "pin: pending {} read queue full, rejecting pin {}",
                    label(kind),
                    pin
                );
                self.publish_pin_error(kind, pin, "pending-pin-overflow");
                return true;
            }
            queue.push_back(request);
        }

        let command = match kind {
            PinKind::Digital => Command::DigitalRead,
            PinKind::Analog => Command::AnalogRead,
        };
        let ctx = self.ctx.clone();
        let locks = self.read_locks.clone();
        self.ctx.schedule_background(async move {
            // Hold the per-kind lock across the send so responses resolve
            // strictly head-of-queue.
            let _guard = match kind {
                PinKind::Digital => locks.digital.lock().await,
                PinKind::Analog => locks.analog.lock().await,
            };
            match ctx.send_frame(command, &[pin]).await {
                SendOutcome::Success(Some(payload)) => {
                    resolve(&ctx, kind, &payload).await;
                }
                outcome => {
                    debug!("pin: {} for pin {} ended {:?}", command.name(), pin, outcome);
                    fail_oldest(&ctx, kind);
                }
            }
        });
        true
    }

    async fn handle_mode(&self, kind: PinKind, pin: u8, message: &InboundMessage) -> bool {
        if kind != PinKind::Digital {
            return false;
        }
        if !self.ctx.authorized(Topic::Digital, Action::PinMode) {
            return true;
        }
        if !self.pin_in_range(kind, pin) {
            self.publish_pin_error(kind, pin, "invalid-pin");
            return true;
        }
        let Some(mode) = parse_mode(&message.payload_str()) else {
            self.publish_pin_error(kind, pin, "bad-mode");
            return true;
        };

        let ctx = self.ctx.clone();
        self.ctx.schedule_background(async move {
            if ctx.send_frame(Command::SetPinMode, &[pin, mode]).await
                != SendOutcome::Success(None)
            {
                warn!("pin: mode change for pin {} failed", pin);
            }
        });
        true
    }

    // ── Response resolution (unsolicited RESP path) ───────────

    /// Answer the oldest pending digital read with `payload = [pin, value]`.
    pub async fn resolve_digital(&self, payload: &[u8]) {
        resolve(&self.ctx, PinKind::Digital, payload).await;
    }

    /// Answer the oldest pending analog read with `payload = [pin, hi, lo]`.
    pub async fn resolve_analog(&self, payload: &[u8]) {
        resolve(&self.ctx, PinKind::Analog, payload).await;
    }

    // ── Helpers ───────────────────────────────────────────────

    fn pin_in_range(&self, kind: PinKind, pin: u8) -> bool {
        let caps = self.ctx.state.capabilities.lock().unwrap();
        match (&*caps, kind) {
            (Some(c), PinKind::Digital) if c.num_digital_pins > 0 => pin < c.num_digital_pins,
            (Some(c), PinKind::Analog) if c.num_analog_inputs > 0 => pin < c.num_analog_inputs,
            // No capability record yet: accept and let the MCU decide.
            _ => true,
        }
    }

    fn value_topic(&self, kind: PinKind, pin: u8) -> String {
        value_topic(&self.ctx, kind, pin)
    }

    fn publish_pin_error(&self, kind: PinKind, pin: u8, kind_name: &str) {
        let message =
            QueuedPublish::new(self.value_topic(kind, pin), Vec::new()).bridge_error(kind_name);
        self.ctx.publish(message);
    }
}

fn pending_of(
    ctx: &BridgeContext,
    kind: PinKind,
) -> &std::sync::Mutex<std::collections::VecDeque<PendingPinRequest>> {
    match kind {
        PinKind::Digital => &ctx.state.pending_digital,
        PinKind::Analog => &ctx.state.pending_analog,
    }
}

fn value_topic(ctx: &BridgeContext, kind: PinKind, pin: u8) -> String {
    match kind {
        PinKind::Digital => ctx.topic(format!("d/{pin}/value")),
        PinKind::Analog => ctx.topic(format!("a/{pin}/value")),
    }
}

/// Pop the oldest pending request of `kind` and answer it with the MCU's
/// response payload.
async fn resolve(ctx: &Arc<BridgeContext>, kind: PinKind, payload: &[u8]) {
    let value = match (kind, payload) {
        (PinKind::Digital, [_pin, value, ..]) => u16::from(*value),
        (PinKind::Analog, [_pin, hi, lo, ..]) => u16::from_be_bytes([*hi, *lo]),
        _ => {
            warn!("pin: malformed {} read response", label(kind));
            return;
        }
    };

    let Some(request) = pending_of(ctx, kind).lock().unwrap().pop_front() else {
        debug!("pin: {} read response with no pending request", label(kind));
        return;
    };

    match request.reply {
        ReplyContext::Mqtt {
            value_topic,
            response_topic,
            correlation,
        } => {
            let message = QueuedPublish::new(value_topic, value.to_string().into_bytes())
                .reply_to(response_topic, correlation);
            ctx.publish(message);
        }
        ReplyContext::Serial => {
            let response = match kind {
                PinKind::Digital => Command::DigitalReadResp,
                PinKind::Analog => Command::AnalogReadResp,
            };
            ctx.respond_mcu(response, payload).await;
        }
    }
}

/// Drop the oldest pending request after a failed read, telling the
/// requester why.
fn fail_oldest(ctx: &Arc<BridgeContext>, kind: PinKind) {
    let Some(request) = pending_of(ctx, kind).lock().unwrap().pop_front() else {
        return;
    };
    if let ReplyContext::Mqtt {
        value_topic,
        response_topic,
        correlation,
    } = request.reply
    {
        let message = QueuedPublish::new(value_topic, Vec::new())
            .reply_to(response_topic, correlation)
            .bridge_error("pin-read-failed");
        ctx.publish(message);
    }
}

fn topic_of(kind: PinKind) -> Topic {
    match kind {
        PinKind::Digital => Topic::Digital,
        PinKind::Analog => Topic::Analog,
    }
}

fn label(kind: PinKind) -> &'static str {
    match kind {
        PinKind::Digital => "digital",
        PinKind::Analog => "analog",
    }
}

fn parse_value(text: &str) -> Option<u16> {
    match text.trim() {
        "on" | "true" | "high" => Some(1),
        "off" | "false" | "low" => Some(0),
        other => other.parse().ok(),
    }
}

fn parse_mode(text: &str) -> Option<u8> {
    match text.trim() {
        "input" | "in" | "0" => Some(0),
        "output" | "out" | "1" => Some(1),
        "input_pullup" | "pullup" | "2" => Some(2),
        _ => None,
    }
}

#[async_trait]
impl TopicHandler for PinService {
    async fn handle(&self, route: &RouteMatch, message: &InboundMessage) -> bool {
        let kind = match route.topic {
            Topic::Digital => PinKind::Digital,
            Topic::Analog => PinKind::Analog,
            _ => return false,
        };
        let Some(pin) = route.segment(0).and_then(|s| s.parse::<u8>().ok()) else {
            return false;
        };

        match route.segment(1) {
            None => self.handle_write(kind, pin, message).await,
            Some("read") => self.handle_read(kind, pin, message).await,
            Some("mode") => self.handle_mode(kind, pin, message).await,
            // Our own value publishes; swallow without complaint.
            Some("value") => true,
            Some(_) => false,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
