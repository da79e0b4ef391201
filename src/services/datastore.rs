//! In-memory key→value store.
//!
//! Contents are volatile and do not survive a daemon restart. Every put
//! (from either side) re-publishes the value on
//! `<prefix>/datastore/get/<key>` so MQTT clients always see the latest
//! state as a retained message.

use std::sync::Arc;

use async_trait::async_trait;
use log::warn;

use crate::mqtt::messages::QueuedPublish;
use crate::router::{Action, InboundMessage, RouteMatch, Topic, TopicHandler};
use crate::rpc::protocol::{Command, MAX_PAYLOAD_SIZE};

use super::BridgeContext;

pub struct DatastoreService {
    ctx: Arc<BridgeContext>,
}

impl DatastoreService {
    pub fn new(ctx: Arc<BridgeContext>) -> Self {
        Self { ctx }
    }

    fn put(&self, key: &str, value: Vec<u8>) {
        self.ctx
            .state
            .datastore
            .lock()
            .unwrap()
            .insert(key.to_string(), value.clone());

        let message =
            QueuedPublish::new(self.ctx.topic(format!("datastore/get/{key}")), value).retain();
        self.ctx.publish(message);
    }

    // ── From MCU ──────────────────────────────────────────────

    /// `CMD_DATASTORE_PUT`: `u8 key_len, key, u8 value_len, value`.
    pub async fn on_mcu_put(&self, payload: &[u8]) {
        let Some((key, rest)) = take_lenprefixed(payload) else {
            warn!("datastore: malformed put payload");
            return;
        };
        let Some((value, _)) = take_lenprefixed(rest) else {
            warn!("datastore: malformed put value");
            return;
        };
        let Ok(key) = std::str::from_utf8(key) else {
            warn!("datastore: non-UTF8 key");
            return;
        };
        self.put(key, value.to_vec());
    }

    /// `CMD_DATASTORE_GET`: `u8 key_len, key` → `u8 value_len, value`.
    pub async fn on_mcu_get(&self, payload: &[u8]) {
        let Some((key, _)) = take_lenprefixed(payload) else {
            warn!("datastore: malformed get payload");
            return;
        };
        let value = std::str::from_utf8(key)
            .ok()
            .and_then(|k| self.ctx.state.datastore.lock().unwrap().get(k).cloned())
            .unwrap_or_default();

        // Value is truncated to what one response frame can carry.
        let cap = value.len().min(255).min(MAX_PAYLOAD_SIZE - 1);
        let mut response = Vec::with_capacity(1 + cap);
        response.push(cap as u8);
        response.extend_from_slice(&value[..cap]);
        self.ctx
            .respond_mcu(Command::DatastoreGetResp, &response)
            .await;
    }
}

fn take_lenprefixed(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let (&len, rest) = data.split_first()?;
    let len = len as usize;
    if rest.len() < len {
        return None;
    }
    Some(rest.split_at(len))
}

#[async_trait]
impl TopicHandler for DatastoreService {
    async fn handle(&self, route: &RouteMatch, message: &InboundMessage) -> bool {
        match route.segment(0) {
            Some("put") => {
                if !self.ctx.authorized(Topic::Datastore, Action::DatastorePut) {
                    return true;
                }
                let key = route.tail(1);
                if key.is_empty() {
                    return false;
                }
                self.put(&key, message.payload.clone());
                true
            }
            // `get/<key>` is where we publish; nothing to consume inbound.
            Some("get") => true,
            _ => false,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
