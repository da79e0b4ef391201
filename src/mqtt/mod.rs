//! MQTT transport: subscriptions, the publisher drain loop, TLS options,
//! and spool restore on reconnect.
//!
//! The publisher only drains the outbound queue while a broker session is
//! up; while disconnected the bounded queue fills and overflow lands in
//! the persistent spool ([`spool`]). On CONNACK the spool contents are
//! re-enqueued ahead of anything queued since, keeping FIFO order across
//! the spool boundary. Inbound publishes are handed to the ingress router
//! one at a time, preserving arrival order.

pub mod messages;
pub mod spool;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{AsyncClient, Event, MqttOptions};
use rumqttc::{TlsConfiguration, Transport};
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::router::{InboundMessage, IngressRouter};
use crate::state::RuntimeState;

use messages::QueuedPublish;

/// Topic filters the bridge subscribes to, relative to the prefix.
const SUBSCRIPTIONS: &[&str] = &[
    "d/+",
    "d/+/read",
    "d/+/mode",
    "a/+",
    "a/+/read",
    "console/in",
    "datastore/put/#",
    "file/write/#",
    "file/read/#",
    "file/remove/#",
    "mailbox/write",
    "sh/run",
    "sh/poll/+",
    "sh/kill/+",
    "system/handshake",
];

pub struct MqttService {
    config: Arc<BridgeConfig>,
    state: Arc<RuntimeState>,
    router: Arc<IngressRouter>,
    shutdown: CancellationToken,
    connected: Arc<AtomicBool>,
}

impl MqttService {
    pub fn new(
        config: Arc<BridgeConfig>,
        state: Arc<RuntimeState>,
        router: Arc<IngressRouter>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            router,
            shutdown,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn options(&self) -> Result<MqttOptions> {
        let client_id = format!("mcubridge-{}", self.config.topic_prefix().replace('/', "-"));
        let mut options = MqttOptions::new(
            client_id,
            self.config.mqtt_host.clone(),
            self.config.mqtt_port,
        );
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_start(true);

        if let (Some(user), Some(pass)) = (&self.config.mqtt_user, &self.config.mqtt_pass) {
            options.set_credentials(user.as_str(), pass.as_str());
        }

        if self.config.mqtt_tls {
            let Some(cafile) = &self.config.mqtt_cafile else {
                return Err(BridgeError::Mqtt(
                    "mqtt_tls enabled but mqtt_cafile not set".into(),
                ));
            };
            let ca = std::fs::read(cafile)
                .map_err(|e| BridgeError::Mqtt(format!("cannot read {cafile}: {e}")))?;

            let client_auth = match (&self.config.mqtt_certfile, &self.config.mqtt_keyfile) {
                (Some(cert), Some(key)) => {
                    let cert = std::fs::read(cert)
                        .map_err(|e| BridgeError::Mqtt(format!("cannot read {cert}: {e}")))?;
                    let key = std::fs::read(key)
                        .map_err(|e| BridgeError::Mqtt(format!("cannot read {key}: {e}")))?;
                    Some((cert, key))
                }
                (None, None) => None,
                _ => {
                    return Err(BridgeError::Mqtt(
                        "mqtt_certfile and mqtt_keyfile must both be set for mTLS".into(),
                    ));
                }
            };

            if self.config.mqtt_tls_insecure {
                // rustls has no insecure mode; certificates are always
                // verified against the configured CA.
                warn!("mqtt: mqtt_tls_insecure is ignored with the rustls backend");
            }

            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth,
            }));
        }

        Ok(options)
    }

    /// One broker session, run under the supervisor: connection errors
    /// return `Err` and the supervisor reconnects with backoff.
    pub async fn run(&self) -> Result<()> {
        let options = self.options()?;
        let (client, mut eventloop) = AsyncClient::new(options, 64);

        let publisher = tokio::spawn(publisher_loop(
            client.clone(),
            self.state.clone(),
            self.connected.clone(),
            self.shutdown.clone(),
        ));

        let result = loop {
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt: connected to {}:{}", self.config.mqtt_host, self.config.mqtt_port);
                        self.subscribe_all(&client).await?;
                        self.restore_spool();
                        self.connected.store(true, Ordering::Relaxed);
                        self.state.mqtt_notify.notify_one();
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let topic = String::from_utf8_lossy(&publish.topic).into_owned();
                        let mut message = InboundMessage::new(topic, publish.payload.to_vec());
                        if let Some(props) = &publish.properties {
                            message.response_topic = props.response_topic.clone();
                            message.correlation = props
                                .correlation_data
                                .as_ref()
                                .map(|b| b.to_vec());
                        }
                        // Serial dispatch preserves arrival order.
                        self.router.dispatch(&message).await;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        self.connected.store(false, Ordering::Relaxed);
                        break Err(BridgeError::Mqtt(err.to_string()));
                    }
                },
                () = self.shutdown.cancelled() => {
                    let _ = client.disconnect().await;
                    break Ok(());
                }
            }
        };

        self.connected.store(false, Ordering::Relaxed);
        publisher.abort();
        result
    }

    async fn subscribe_all(&self, client: &AsyncClient) -> Result<()> {
        let prefix = self.config.topic_prefix();
        for filter in SUBSCRIPTIONS {
            let topic = format!("{prefix}/{filter}");
            client
                .subscribe(topic.clone(), QoS::AtLeastOnce)
                .await
                .map_err(|e| BridgeError::Mqtt(format!("subscribe {topic}: {e}")))?;
        }
        Ok(())
    }

    /// Move spooled publishes back into the queue, ahead of anything that
    /// queued up meanwhile.
    fn restore_spool(&self) {
        let spooled = self.state.spool.drain();
        if spooled.is_empty() {
            return;
        }
        info!("mqtt: restoring {} spooled publishes", spooled.len());

        let mut queue = self.state.mqtt_queue.lock().unwrap();
        let newer = queue.drain_all();
        for message in spooled.into_iter().chain(newer) {
            queue.push_drop_oldest(message);
        }
    }
}

/// Drain the outbound queue while connected. Transient publish failures
/// requeue the message at the front and pause briefly.
async fn publisher_loop(
    client: AsyncClient,
    state: Arc<RuntimeState>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }

        if !connected.load(Ordering::Relaxed) {
            tokio::select! {
                () = state.mqtt_notify.notified() => continue,
                () = tokio::time::sleep(Duration::from_millis(500)) => continue,
                () = shutdown.cancelled() => return,
            }
        }

        let message = {
            let mut queue = state.mqtt_queue.lock().unwrap();
            queue.pop_front()
        };

        let Some(message) = message else {
            tokio::select! {
                () = state.mqtt_notify.notified() => {}
                () = tokio::time::sleep(Duration::from_secs(1)) => {}
                () = shutdown.cancelled() => return,
            }
            continue;
        };

        let result = publish_one(&client, &message).await;
        match result {
            Ok(()) => {
                state.mqtt_published.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                debug!("mqtt: publish to {} failed: {err}", message.topic);
                state.mqtt_requeued.fetch_add(1, Ordering::Relaxed);
                state.mqtt_queue.lock().unwrap().push_front(message);
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_millis(500)) => {}
                    () = shutdown.cancelled() => return,
                }
            }
        }
    }
}

async fn publish_one(client: &AsyncClient, message: &QueuedPublish) -> std::result::Result<(), String> {
    match message.publish_properties() {
        Some(props) => client
            .publish_with_properties(
                message.topic.clone(),
                message.mqtt_qos(),
                message.retain,
                message.payload.clone(),
                props,
            )
            .await
            .map_err(|e| e.to_string()),
        None => client
            .publish(
                message.topic.clone(),
                message.mqtt_qos(),
                message.retain,
                message.payload.clone(),
            )
            .await
            .map_err(|e| e.to_string()),
    }
}

// ── Tests ────────────────────────────────────────────────────
