//! Console bridging.
//!
//! MCU → MQTT: `CMD_CONSOLE_WRITE` payloads are published on
//! `<prefix>/console/out`. MQTT → MCU: `console/in` payloads are chunked to
//! the payload limit and sent to the MCU, or parked in the bounded console
//! queue while the MCU has signalled XOFF. XON flips the flag back and
//! flushes the queue in order.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use log::{debug, warn};

use crate::mqtt::messages::QueuedPublish;
use crate::router::{Action, InboundMessage, RouteMatch, Topic, TopicHandler};
use crate::rpc::flow::SendOutcome;
use crate::rpc::protocol::{Command, MAX_PAYLOAD_SIZE};

use super::BridgeContext;

pub struct ConsoleService {
    ctx: Arc<BridgeContext>,
    /// Serialises console sends so interleaved input and XON flushes keep
    /// byte order.
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl ConsoleService {
    pub fn new(ctx: Arc<BridgeContext>) -> Self {
        Self {
            ctx,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    // ── From MCU ──────────────────────────────────────────────

    /// `CMD_CONSOLE_WRITE`: forward console output to MQTT.
    pub fn on_mcu_write(&self, payload: &[u8]) {
        let message = QueuedPublish::new(self.ctx.topic("console/out"), payload.to_vec());
        self.ctx.publish(message);
    }

    /// `CMD_CONSOLE_XOFF`: MCU buffer is full, park further input.
    pub fn on_mcu_xoff(&self) {
        debug!("console: XOFF, pausing MCU writes");
        self.ctx.state.mcu_paused.store(true, Ordering::Relaxed);
    }

    /// `CMD_CONSOLE_XON`: resume and flush everything parked.
    pub fn on_mcu_xon(&self) {
        debug!("console: XON, flushing parked input");
        self.ctx.state.mcu_paused.store(false, Ordering::Relaxed);

        let ctx = self.ctx.clone();
        let write_lock = self.write_lock.clone();
        self.ctx.schedule_background(async move {
            let _ordered = write_lock.lock().await;
            loop {
                let chunk = {
                    let mut queue = ctx.state.console_queue.lock().unwrap();
                    queue.pop_front()
                };
                let Some(chunk) = chunk else { break };
                if ctx.state.mcu_paused.load(Ordering::Relaxed) {
                    // Paused again mid-flush; put the chunk back.
                    ctx.state.console_queue.lock().unwrap().push_front(chunk);
                    break;
                }
                if ctx.send_frame(Command::ConsoleWrite, &chunk).await
                    != SendOutcome::Success(None)
                {
                    warn!("console: flush write failed, dropping chunk");
                }
            }
        });
    }

    // ── From MQTT ─────────────────────────────────────────────

    fn handle_input(&self, message: &InboundMessage) -> bool {
        if !self.ctx.authorized(Topic::Console, Action::ConsoleInput) {
            return true;
        }

        let chunks: Vec<Vec<u8>> = message
            .payload
            .chunks(MAX_PAYLOAD_SIZE)
            .map(<[u8]>::to_vec)
            .collect();

        if self.ctx.state.mcu_paused.load(Ordering::Relaxed) {
            let mut queue = self.ctx.state.console_queue.lock().unwrap();
            for chunk in chunks {
                queue.push_drop_oldest(chunk);
            }
            return true;
        }

        let ctx = self.ctx.clone();
        let write_lock = self.write_lock.clone();
        self.ctx.schedule_background(async move {
            let _ordered = write_lock.lock().await;
            for chunk in chunks {
                if ctx.state.mcu_paused.load(Ordering::Relaxed) {
                    // XOFF arrived mid-stream: park the rest.
                    ctx.state
                        .console_queue
                        .lock()
                        .unwrap()
                        .push_drop_oldest(chunk);
                    continue;
                }
                if ctx.send_frame(Command::ConsoleWrite, &chunk).await
                    != SendOutcome::Success(None)
                {
                    warn!("console: write to MCU failed, dropping chunk");
                }
            }
        });
        true
    }
}

#[async_trait]
impl TopicHandler for ConsoleService {
    async fn handle(&self, route: &RouteMatch, message: &InboundMessage) -> bool {
        match route.segment(0) {
            Some("in") => self.handle_input(message),
            // Our own publishes.
            Some("out") => true,
            _ => false,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::protocol::Status;
    use crate::services::testutil::{drain_publishes, harness, read_frame};

    #[tokio::test]
    async fn mcu_output_lands_on_console_out() {
        let h = harness().await;
        let console = ConsoleService::new(h.ctx.clone());
        console.on_mcu_write(b"hello from mcu\n");

        let events = drain_publishes(&h.ctx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].topic, "br/console/out");
        assert_eq!(events[0].payload, b"hello from mcu\n");
    }

    #[tokio::test]
    async fn input_reaches_mcu_when_running() {
        let mut h = harness().await;
        let console = ConsoleService::new(h.ctx.clone());
        let route = RouteMatch {
            topic: Topic::Console,
            segments: vec!["in".into()],
        };
        let msg = InboundMessage::new("br/console/in", b"ls\n".to_vec());
        assert!(console.handle(&route, &msg).await);

        let (cmd, payload) = read_frame(&mut h.mcu).await;
        assert_eq!(cmd, Command::ConsoleWrite as u16);
        assert_eq!(payload, b"ls\n");
    }

    #[tokio::test]
    async fn long_input_is_chunked() {
        let mut h = harness().await;
        let console = ConsoleService::new(h.ctx.clone());
        let route = RouteMatch {
            topic: Topic::Console,
            segments: vec!["in".into()],
        };
        let big = vec![b'x'; MAX_PAYLOAD_SIZE + 10];
        let msg = InboundMessage::new("br/console/in", big);
        assert!(console.handle(&route, &msg).await);

        let (_, first) = read_frame(&mut h.mcu).await;
        assert_eq!(first.len(), MAX_PAYLOAD_SIZE);
        h.ctx.flow.on_frame(
            Status::Ack as u16,
            &(Command::ConsoleWrite as u16).to_be_bytes(),
        );
        let (_, second) = read_frame(&mut h.mcu).await;
        assert_eq!(second.len(), 10);
    }

    #[tokio::test]
    async fn xoff_parks_input_and_xon_flushes() {
        let mut h = harness().await;
        let console = ConsoleService::new(h.ctx.clone());
        console.on_mcu_xoff();

        let route = RouteMatch {
            topic: Topic::Console,
            segments: vec!["in".into()],
        };
        let msg = InboundMessage::new("br/console/in", b"parked".to_vec());
        assert!(console.handle(&route, &msg).await);
        assert_eq!(h.ctx.state.console_queue.lock().unwrap().len(), 1);

        console.on_mcu_xon();
        let (cmd, payload) = read_frame(&mut h.mcu).await;
        assert_eq!(cmd, Command::ConsoleWrite as u16);
        assert_eq!(payload, b"parked");
    }

    #[tokio::test]
    async fn console_queue_is_byte_bounded() {
        let config = crate::config::BridgeConfig {
            serial_shared_secret: "mcubridge-shared".into(),
            console_queue_limit_bytes: 8,
            ..crate::config::BridgeConfig::default()
        };
        let h = crate::services::testutil::harness_with(config).await;
        let console = ConsoleService::new(h.ctx.clone());
        console.on_mcu_xoff();

        let route = RouteMatch {
            topic: Topic::Console,
            segments: vec!["in".into()],
        };
        for _ in 0..4 {
            let msg = InboundMessage::new("br/console/in", b"abcd".to_vec());
            console.handle(&route, &msg).await;
        }
        let queue = h.ctx.state.console_queue.lock().unwrap();
        assert!(queue.bytes() <= 8);
        assert_eq!(queue.dropped(), 2);
    }
}
