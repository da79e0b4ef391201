//! Service components — one per bridge capability.
//!
//! Each component exposes two handler surfaces over the same
//! [`BridgeContext`]:
//!
//! - **from-MCU**: invoked by the serial transport once a frame has passed
//!   header validation, CRC, and decompression. The synchronous prologue of
//!   a handler runs before the next frame is dispatched; anything that
//!   waits on the link (`send_frame`) is pushed to the background so the
//!   read loop never deadlocks on its own ACKs.
//! - **from-MQTT**: invoked by the ingress router in registration order.

pub mod console;
pub mod datastore;
pub mod file;
pub mod mailbox;
pub mod pin;
pub mod process;
pub mod system;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::mqtt::messages::QueuedPublish;
use crate::router::{Action, IngressRouter, Topic, TopicAuthorization};
use crate::rpc::flow::{FlowController, SendOutcome};
use crate::rpc::protocol::{Command, Status};
use crate::state::RuntimeState;

/// Capability handle shared by every service component.
pub struct BridgeContext {
    pub config: Arc<BridgeConfig>,
    pub state: Arc<RuntimeState>,
    pub flow: Arc<FlowController>,
    pub authorization: TopicAuthorization,
    pub shutdown: CancellationToken,
    prefix: String,
}

impl BridgeContext {
    pub fn new(
        config: Arc<BridgeConfig>,
        state: Arc<RuntimeState>,
        flow: Arc<FlowController>,
        authorization: TopicAuthorization,
        shutdown: CancellationToken,
    ) -> Self {
        let prefix = config.topic_prefix();
        Self {
            config,
            state,
            flow,
            authorization,
            shutdown,
            prefix,
        }
    }

    /// Full topic under the configured prefix.
    pub fn topic(&self, suffix: impl AsRef<str>) -> String {
        format!("{}/{}", self.prefix, suffix.as_ref())
    }

    /// Send one command through the flow controller.
    pub async fn send_frame(&self, command: Command, payload: &[u8]) -> SendOutcome {
        self.flow.send(command, payload).await
    }

    /// Enqueue an outbound MQTT publish (spools on overflow).
    pub fn publish(&self, message: QueuedPublish) -> bool {
        self.state.enqueue_mqtt(message)
    }

    /// ACK an MCU command we just dispatched.
    pub async fn ack_mcu(&self, command: Command) {
        let payload = (command as u16).to_be_bytes();
        if let Err(err) = self.flow.write_raw(Status::Ack as u16, &payload).await {
            debug!("ack for {} not written: {}", command.name(), err);
        }
    }

    /// Report a failure status for an MCU command.
    pub async fn fail_mcu(&self, command: Command, status: Status) {
        let payload = (command as u16).to_be_bytes();
        if let Err(err) = self.flow.write_raw(status as u16, &payload).await {
            debug!("status for {} not written: {}", command.name(), err);
        }
    }

    /// Write a `*_RESP` frame back to the MCU.
    pub async fn respond_mcu(&self, response: Command, payload: &[u8]) {
        if let Err(err) = self.flow.write_raw(response as u16, payload).await {
            debug!("response {} not written: {}", response.name(), err);
        }
    }

    /// Allow-list policy: when the configured list is non-empty and lacks
    /// `*`, the command's first token must be present (case-insensitive).
    pub fn is_command_allowed(&self, command: &str) -> bool {
        let list = &self.config.allowed_commands;
        if list.is_empty() || list.iter().any(|c| c == "*") {
            return true;
        }
        let Some(first) = command.split_whitespace().next() else {
            return false;
        };
        list.iter().any(|c| c.eq_ignore_ascii_case(first))
    }

    /// Authorisation gate with a uniform denial log.
    pub fn authorized(&self, topic: Topic, action: Action) -> bool {
        if self.authorization.allows(topic, action) {
            true
        } else {
            warn!("policy: {} denied", action.name());
            false
        }
    }

    /// Spawn follow-up work so a from-MCU prologue returns promptly.
    pub fn schedule_background(&self, future: impl Future<Output = ()> + Send + 'static) {
        let _detached = tokio::spawn(future);
    }
}

/// All service components plus the from-MCU dispatch table.
pub struct Bridge {
    pub ctx: Arc<BridgeContext>,
    pub pin: Arc<pin::PinService>,
    pub console: Arc<console::ConsoleService>,
    pub datastore: Arc<datastore::DatastoreService>,
    pub file: Arc<file::FileService>,
    pub mailbox: Arc<mailbox::MailboxService>,
    pub process: Arc<process::ProcessService>,
    pub system: Arc<system::SystemService>,
}

impl Bridge {
    pub fn new(ctx: Arc<BridgeContext>) -> Self {
        Self {
            pin: Arc::new(pin::PinService::new(ctx.clone())),
            console: Arc::new(console::ConsoleService::new(ctx.clone())),
            datastore: Arc::new(datastore::DatastoreService::new(ctx.clone())),
            file: Arc::new(file::FileService::new(ctx.clone())),
            mailbox: Arc::new(mailbox::MailboxService::new(ctx.clone())),
            process: Arc::new(process::ProcessService::new(ctx.clone())),
            system: Arc::new(system::SystemService::new(ctx.clone())),
            ctx,
        }
    }

    /// Build the MQTT ingress router over these components.
    pub fn build_router(&self) -> IngressRouter {
        let mut router = IngressRouter::new(self.ctx.config.topic_prefix());
        router.register(Topic::Digital, self.pin.clone());
        router.register(Topic::Analog, self.pin.clone());
        router.register(Topic::Console, self.console.clone());
        router.register(Topic::Datastore, self.datastore.clone());
        router.register(Topic::File, self.file.clone());
        router.register(Topic::Mailbox, self.mailbox.clone());
        router.register(Topic::Shell, self.process.clone());
        router.register(Topic::System, self.system.clone());
        router
    }

    /// Dispatch one validated, decompressed MCU frame to its component.
    ///
    /// Recognised commands are ACKed before their handler runs so the MCU's
    /// short retry timer is satisfied; request commands answer with their
    /// `*_RESP` afterwards.
    pub async fn handle_mcu_frame(&self, command_id: u16, payload: Vec<u8>) {
        let Some(command) = Command::from_u16(command_id) else {
            debug!("mcu: unknown command {:#06x}", command_id);
            self.ctx
                .state
                .serial_errors
                .unexpected_status
                .fetch_add(1, Ordering::Relaxed);
            if let Err(err) = self
                .ctx
                .flow
                .write_raw(Status::Unsupported as u16, &command_id.to_be_bytes())
                .await
            {
                debug!("unsupported status not written: {}", err);
            }
            return;
        };

        match command {
            Command::ConsoleWrite => {
                self.ctx.ack_mcu(command).await;
                self.console.on_mcu_write(&payload);
            }
            Command::ConsoleXon => {
                self.ctx.ack_mcu(command).await;
                self.console.on_mcu_xon();
            }
            Command::ConsoleXoff => {
                self.ctx.ack_mcu(command).await;
                self.console.on_mcu_xoff();
            }

            Command::DatastorePut => {
                self.ctx.ack_mcu(command).await;
                self.datastore.on_mcu_put(&payload).await;
            }
            Command::DatastoreGet => {
                self.ctx.ack_mcu(command).await;
                self.datastore.on_mcu_get(&payload).await;
            }

            // File ops deliver their own ACK/ERROR after the I/O runs.
            Command::FileWrite | Command::FileRead | Command::FileRemove => {
                self.file.on_mcu_frame(command, payload);
            }

            Command::MailboxAvailable => {
                self.ctx.ack_mcu(command).await;
                self.mailbox.on_mcu_available().await;
            }
            Command::MailboxRead => {
                self.ctx.ack_mcu(command).await;
                self.mailbox.on_mcu_read().await;
            }
            Command::MailboxPush => {
                self.ctx.ack_mcu(command).await;
                self.mailbox.on_mcu_push(&payload);
            }

            Command::ProcessRun | Command::ProcessRunAsync => {
                self.ctx.ack_mcu(command).await;
                self.process.on_mcu_run(command, payload);
            }
            Command::ProcessPoll => {
                self.ctx.ack_mcu(command).await;
                self.process.on_mcu_poll(&payload).await;
            }
            Command::ProcessKill => {
                self.ctx.ack_mcu(command).await;
                self.process.on_mcu_kill(&payload).await;
            }

            Command::GetVersion
            | Command::GetFreeMemory
            | Command::LinkReset
            | Command::Capabilities
            | Command::Keepalive => {
                self.ctx.ack_mcu(command).await;
                self.system.on_mcu_frame(command, &payload).await;
            }

            // Unsolicited read responses (no pending command consumed
            // them): answer the oldest queued pin request anyway.
            Command::DigitalReadResp => self.pin.resolve_digital(&payload).await,
            Command::AnalogReadResp => self.pin.resolve_analog(&payload).await,

            other => {
                debug!("mcu: {} not valid in this direction", other.name());
                self.ctx.fail_mcu(other, Status::Unsupported).await;
            }
        }
    }

    /// Hook: serial link is up and authenticated.
    pub async fn on_serial_connected(&self) {
        self.ctx.state.serial_synced.store(true, Ordering::Relaxed);
        self.ctx.state.mcu_paused.store(false, Ordering::Relaxed);
    }

    /// Hook: serial link dropped.
    pub async fn on_serial_disconnected(&self) {
        self.ctx.state.serial_synced.store(false, Ordering::Relaxed);
    }
}

// ── Test harness ─────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::*;
    use testutil::harness;

    #[tokio::test]
    async fn allow_list_policy() {
        let h = harness().await;
        // Empty list allows everything.
        assert!(h.ctx.is_command_allowed("reboot now"));

        let mut config = (*h.ctx.config).clone();
        config.allowed_commands = vec!["uptime".into(), "Cat".into()];
        let ctx = BridgeContext::new(
            Arc::new(config),
            h.ctx.state.clone(),
            h.ctx.flow.clone(),
            TopicAuthorization::allow_all(),
            h.ctx.shutdown.clone(),
        );
        assert!(ctx.is_command_allowed("uptime"));
        assert!(ctx.is_command_allowed("UPTIME -p"));
        assert!(ctx.is_command_allowed("cat /proc/loadavg"));
        assert!(!ctx.is_command_allowed("rm -rf /"));
        assert!(!ctx.is_command_allowed(""));
    }

    #[tokio::test]
    async fn wildcard_allows_everything() {
        let mut config = BridgeConfig {
            serial_shared_secret: "mcubridge-shared".into(),
            ..BridgeConfig::default()
        };
        config.allowed_commands = vec!["*".into()];
        let h = testutil::harness_with(config).await;
        assert!(h.ctx.is_command_allowed("anything at all"));
    }

    #[tokio::test]
    async fn topic_builder_uses_prefix() {
        let h = harness().await;
        assert_eq!(h.ctx.topic("console/out"), "br/console/out");
    }
}
