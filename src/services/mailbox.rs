//! Mailbox queues between MQTT clients and the MCU.
//!
//! Two double-capped queues (count and bytes):
//!
//! - **outgoing** (MQTT → MCU): filled by `mailbox/write`, drained when the
//!   MCU polls with `CMD_MAILBOX_AVAILABLE` / `CMD_MAILBOX_READ`.
//! - **incoming** (MCU → MQTT): filled by `CMD_MAILBOX_PUSH`, published on
//!   `mailbox/processed`.
//!
//! Depth changes are mirrored on the `*_available` count topics; overflow
//! publishes carry `bridge-error=mailbox`.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};

use crate::mqtt::messages::QueuedPublish;
use crate::router::{Action, InboundMessage, RouteMatch, Topic, TopicHandler};
use crate::rpc::protocol::Command;

use super::BridgeContext;

pub struct MailboxService {
    ctx: Arc<BridgeContext>,
}

impl MailboxService {
    pub fn new(ctx: Arc<BridgeContext>) -> Self {
        Self { ctx }
    }

    fn publish_count(&self, topic_suffix: &str, count: usize, overflowed: bool) {
        let mut message = QueuedPublish::new(
            self.ctx.topic(topic_suffix),
            count.to_string().into_bytes(),
        );
        if overflowed {
            message = message.bridge_error("mailbox");
        }
        self.ctx.publish(message);
    }

    // ── From MCU ──────────────────────────────────────────────

    /// `CMD_MAILBOX_AVAILABLE`: answer with the outgoing queue depth.
    pub async fn on_mcu_available(&self) {
        let count = self.ctx.state.mailbox_outgoing.lock().unwrap().len();
        let response = (count.min(u16::MAX as usize) as u16).to_be_bytes();
        self.ctx
            .respond_mcu(Command::MailboxAvailableResp, &response)
            .await;
    }

    /// `CMD_MAILBOX_READ`: pop one message, length-prefixed. A failed
    /// serial write puts the message back at the front with byte
    /// accounting intact.
    pub async fn on_mcu_read(&self) {
        let message = self.ctx.state.mailbox_outgoing.lock().unwrap().pop_front();

        let Some(message) = message else {
            self.ctx
                .respond_mcu(Command::MailboxReadResp, &0u16.to_be_bytes())
                .await;
            return;
        };

        let mut response = Vec::with_capacity(2 + message.len());
        response.extend_from_slice(&(message.len() as u16).to_be_bytes());
        response.extend_from_slice(&message);

        if let Err(err) = self
            .ctx
            .flow
            .write_raw(Command::MailboxReadResp as u16, &response)
            .await
        {
            warn!("mailbox: read response failed ({err}), requeuing message");
            self.ctx
                .state
                .mailbox_outgoing
                .lock()
                .unwrap()
                .push_front(message);
            return;
        }

        let count = self.ctx.state.mailbox_outgoing.lock().unwrap().len();
        self.publish_count("mailbox/outgoing_available", count, false);
    }

    /// `CMD_MAILBOX_PUSH`: MCU → MQTT message.
    pub fn on_mcu_push(&self, payload: &[u8]) {
        let overflowed = {
            let mut queue = self.ctx.state.mailbox_incoming.lock().unwrap();
            !queue.push_drop_oldest(payload.to_vec())
        };

        // Drain straight out to MQTT; the queue only holds depth while the
        // publish path is saturated.
        let drained: Vec<Vec<u8>> = {
            let mut queue = self.ctx.state.mailbox_incoming.lock().unwrap();
            let mut out = Vec::new();
            while let Some(m) = queue.pop_front() {
                out.push(m);
            }
            out
        };
        for message in drained {
            self.ctx
                .publish(QueuedPublish::new(self.ctx.topic("mailbox/processed"), message));
        }

        let count = self.ctx.state.mailbox_incoming.lock().unwrap().len();
        self.publish_count("mailbox/incoming_available", count, overflowed);
    }

    // ── From MQTT ─────────────────────────────────────────────

    fn handle_write(&self, message: &InboundMessage) -> bool {
        if !self.ctx.authorized(Topic::Mailbox, Action::MailboxWrite) {
            return true;
        }
        let overflowed = {
            let mut queue = self.ctx.state.mailbox_outgoing.lock().unwrap();
            !queue.push_drop_oldest(message.payload.clone())
        };
        if overflowed {
            debug!("mailbox: outgoing queue overflowed");
        }
        let count = self.ctx.state.mailbox_outgoing.lock().unwrap().len();
        self.publish_count("mailbox/outgoing_available", count, overflowed);
        true
    }
}

#[async_trait]
impl TopicHandler for MailboxService {
    async fn handle(&self, route: &RouteMatch, message: &InboundMessage) -> bool {
        match route.segment(0) {
            Some("write") => self.handle_write(message),
            // Topics we publish; swallow inbound echoes.
            Some("processed" | "incoming_available" | "outgoing_available") => true,
            _ => false,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
