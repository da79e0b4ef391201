//! End-to-end bridge scenarios over an in-memory serial link.
//!
//! The serial transport runs against duplex pipes produced by a test port
//! factory; each open spawns a scripted MCU that speaks the real wire
//! protocol (COBS + frames + handshake tags). MQTT stays virtual: inbound
//! messages are dispatched straight into the router, outbound publishes
//! are drained from the runtime queue.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;

use mcubridge::config::BridgeConfig;
use mcubridge::mqtt::messages::QueuedPublish;
use mcubridge::mqtt::spool::MqttSpool;
use mcubridge::router::{InboundMessage, IngressRouter, TopicAuthorization};
use mcubridge::rpc::flow::{FlowController, FlowTiming, SendOutcome};
use mcubridge::rpc::handshake::HandshakeManager;
use mcubridge::rpc::protocol::{CMD_FLAG_COMPRESSED, CMD_ID_MASK, Command, Status};
use mcubridge::rpc::{frame, rle, wire};
use mcubridge::serial::{PortFactory, SerialStreamBox, SerialTransport};
use mcubridge::services::{Bridge, BridgeContext};
use mcubridge::state::RuntimeState;

const SECRET: &[u8] = b"mcubridge-shared";

// ── Scripted MCU ─────────────────────────────────────────────

#[derive(Default)]
struct McuScript {
    /// Replay the first link-sync response on every later session.
    replay_sync_response: bool,
    /// Close the link right after a successful handshake (session 1).
    drop_after_handshake: bool,
    /// ACK pin reads but never answer them.
    ignore_pin_reads: bool,
}

struct McuRecorder {
    /// Every service frame seen, flag stripped and payload decompressed.
    frames: Mutex<Vec<(u16, Vec<u8>)>>,
    /// Command ids that arrived with the compression flag set.
    compressed: Mutex<Vec<u16>>,
    sessions: AtomicU32,
    handshakes_completed: AtomicU32,
    stored_sync_response: Mutex<Option<Vec<u8>>>,
}

impl McuRecorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
            compressed: Mutex::new(Vec::new()),
            sessions: AtomicU32::new(0),
            handshakes_completed: AtomicU32::new(0),
            stored_sync_response: Mutex::new(None),
        })
    }

    fn record(&self, command_id: u16, payload: &[u8]) {
        self.frames
            .lock()
            .unwrap()
            .push((command_id, payload.to_vec()));
    }

    fn recorded(&self, command: Command) -> Vec<Vec<u8>> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == command as u16)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

async fn write_frame(stream: &mut DuplexStream, command_id: u16, payload: &[u8]) {
    let raw = frame::build(command_id, payload).unwrap();
    let mut packet = wire::cobs_encode(&raw);
    packet.push(0);
    let _ = stream.write_all(&packet).await;
    let _ = stream.flush().await;
}

async fn ack(stream: &mut DuplexStream, command_id: u16) {
    write_frame(stream, Status::Ack as u16, &command_id.to_be_bytes()).await;
}

/// One scripted MCU session over one duplex stream.
async fn run_mcu(mut stream: DuplexStream, script: Arc<McuScript>, recorder: Arc<McuRecorder>) {
    let session = recorder.sessions.fetch_add(1, Ordering::SeqCst) + 1;
    let mut splitter = wire::PacketSplitter::new();
    let mut buf = [0u8; 1024];

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let mut packets = Vec::new();
        splitter.feed(&buf[..n], |p| packets.push(p.to_vec()));

        for packet in packets {
            let raw = match wire::cobs_decode(&packet) {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            let Ok((wire_id, mut payload)) = frame::parse(&raw) else {
                continue;
            };
            let command_id = wire_id & CMD_ID_MASK;
            if wire_id & CMD_FLAG_COMPRESSED != 0 {
                recorder.compressed.lock().unwrap().push(command_id);
                payload = rle::decode(&payload).unwrap();
            }

            match Command::from_u16(command_id) {
                Some(Command::LinkSync) => {
                    ack(&mut stream, command_id).await;
                    let response = if script.replay_sync_response && session > 1 {
                        recorder
                            .stored_sync_response
                            .lock()
                            .unwrap()
                            .clone()
                            .expect("a stored response to replay")
                    } else {
                        let mut response = payload.clone();
                        response
                            .extend_from_slice(&HandshakeManager::calculate_tag(SECRET, &payload));
                        *recorder.stored_sync_response.lock().unwrap() = Some(response.clone());
                        response
                    };
                    write_frame(&mut stream, Command::LinkSyncResp as u16, &response).await;
                }

                Some(Command::LinkConfig) => {
                    ack(&mut stream, command_id).await;
                    recorder.handshakes_completed.fetch_add(1, Ordering::SeqCst);
                    if script.drop_after_handshake && session == 1 {
                        return;
                    }
                }

                Some(Command::SetBaudrate) => {
                    recorder.record(command_id, &payload);
                    ack(&mut stream, command_id).await;
                    write_frame(&mut stream, Command::SetBaudrateResp as u16, &payload).await;
                }

                Some(Command::DigitalRead) => {
                    recorder.record(command_id, &payload);
                    ack(&mut stream, command_id).await;
                    if !script.ignore_pin_reads {
                        let pin = payload.first().copied().unwrap_or(0);
                        write_frame(&mut stream, Command::DigitalReadResp as u16, &[pin, 1])
                            .await;
                    }
                }

                Some(_) => {
                    recorder.record(command_id, &payload);
                    ack(&mut stream, command_id).await;
                }

                None => {}
            }
        }
    }
}

struct ScriptedFactory {
    script: Arc<McuScript>,
    recorder: Arc<McuRecorder>,
}

impl PortFactory for ScriptedFactory {
    fn open(&self, _baud: u32) -> std::io::Result<SerialStreamBox> {
        let (gateway, mcu) = tokio::io::duplex(32 * 1024);
        let _mcu_task = tokio::spawn(run_mcu(mcu, self.script.clone(), self.recorder.clone()));
        Ok(Box::new(gateway))
    }
}

// ── Harness ──────────────────────────────────────────────────

struct Scenario {
    ctx: Arc<BridgeContext>,
    router: Arc<IngressRouter>,
    recorder: Arc<McuRecorder>,
    shutdown: CancellationToken,
    transport_task: tokio::task::JoinHandle<mcubridge::error::Result<()>>,
    _dirs: Vec<tempfile::TempDir>,
}

async fn start(script: McuScript, tweak: impl FnOnce(&mut BridgeConfig)) -> Scenario {
    let spool_dir = tempfile::tempdir().unwrap();
    let file_root = tempfile::tempdir().unwrap();

    let mut config = BridgeConfig {
        serial_shared_secret: String::from_utf8(SECRET.to_vec()).unwrap(),
        mqtt_topic: "br".into(),
        mqtt_spool_dir: spool_dir.path().display().to_string(),
        file_system_root: file_root.path().display().to_string(),
        // Same baud both ways: skip negotiation unless a test asks for it.
        serial_baud: 115_200,
        serial_safe_baud: 115_200,
        reconnect_delay: 0.02,
        serial_handshake_min_interval: 0.01,
        ..BridgeConfig::default()
    };
    tweak(&mut config);

    let spool = MqttSpool::open(&config.mqtt_spool_dir, config.mqtt_spool_limit).unwrap();
    let config = Arc::new(config);
    let state = Arc::new(RuntimeState::new(&config, spool));
    let shutdown = CancellationToken::new();

    let flow = Arc::new(FlowController::new(
        FlowTiming {
            ack_timeout: Duration::from_millis(60),
            response_timeout: Duration::from_millis(250),
            max_attempts: 3,
            backoff_cap: Duration::from_millis(120),
        },
        state.clone(),
        shutdown.clone(),
    ));

    let ctx = Arc::new(BridgeContext::new(
        config.clone(),
        state.clone(),
        flow.clone(),
        TopicAuthorization::allow_all(),
        shutdown.clone(),
    ));
    let bridge = Arc::new(Bridge::new(ctx.clone()));
    let router = Arc::new(bridge.build_router());

    let recorder = McuRecorder::new();
    let factory = ScriptedFactory {
        script: Arc::new(script),
        recorder: recorder.clone(),
    };

    let transport = Arc::new(SerialTransport::new(
        config,
        state,
        flow,
        bridge,
        Box::new(factory),
        shutdown.clone(),
    ));
    let transport_task = tokio::spawn(async move { transport.run().await });

    Scenario {
        ctx,
        router,
        recorder,
        shutdown,
        transport_task,
        _dirs: vec![spool_dir, file_root],
    }
}

impl Scenario {
    async fn wait_synced(&self) {
        let state = self.ctx.state.clone();
        wait_for(move || state.serial_synced.load(Ordering::Relaxed)).await;
    }

    fn drain_publishes(&self) -> Vec<QueuedPublish> {
        self.ctx.state.mqtt_queue.lock().unwrap().drain_all()
    }

    async fn finish(self) {
        self.shutdown.cancel();
        let _ = self.transport_task.await;
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}

// ── Scenarios ────────────────────────────────────────────────

/// LED on: `br/d/13` payload "1" becomes exactly one CMD_DIGITAL_WRITE
/// with payload 0x0D 0x01, acknowledged by the MCU.
#[tokio::test]
async fn led_on() {
    let scenario = start(McuScript::default(), |_| {}).await;
    scenario.wait_synced().await;

    let message = InboundMessage::new("br/d/13", b"1".to_vec());
    assert!(scenario.router.dispatch(&message).await);

    let recorder = scenario.recorder.clone();
    wait_for(move || !recorder.recorded(Command::DigitalWrite).is_empty()).await;
    assert_eq!(
        scenario.recorder.recorded(Command::DigitalWrite),
        vec![vec![0x0D, 0x01]]
    );

    scenario.finish().await;
}

/// Datastore round-trip: put lands in the map and is re-published on the
/// get topic, without snapshot tagging.
#[tokio::test]
async fn datastore_round_trip() {
    let scenario = start(McuScript::default(), |_| {}).await;
    scenario.wait_synced().await;
    let _ = scenario.drain_publishes();

    let message = InboundMessage::new("br/datastore/put/foo", b"bar".to_vec());
    assert!(scenario.router.dispatch(&message).await);

    assert_eq!(
        scenario.ctx.state.datastore.lock().unwrap().get("foo"),
        Some(&b"bar".to_vec())
    );

    let publishes = scenario.drain_publishes();
    let get: Vec<_> = publishes
        .iter()
        .filter(|m| m.topic == "br/datastore/get/foo")
        .collect();
    assert_eq!(get.len(), 1);
    assert_eq!(get[0].payload, b"bar");
    assert!(
        !get[0]
            .user_properties
            .iter()
            .any(|(k, _)| k == "bridge-snapshot")
    );

    scenario.finish().await;
}

/// Handshake replay: a previously accepted CMD_LINK_SYNC_RESP replayed on
/// the next connection fails with anti-replay and does not advance the
/// accepted counter.
#[tokio::test]
async fn handshake_replay_is_rejected() {
    let scenario = start(
        McuScript {
            replay_sync_response: true,
            drop_after_handshake: true,
            ..McuScript::default()
        },
        |_| {},
    )
    .await;

    // Session 1 handshake succeeds and records counter 1.
    let state = scenario.ctx.state.clone();
    wait_for(move || state.handshake.lock().unwrap().replay_counter == 1).await;

    // Session 1 drops; session 2 replays the stored response and fails.
    let state = scenario.ctx.state.clone();
    wait_for(move || state.handshake.lock().unwrap().failures >= 1).await;

    let stats = scenario.ctx.state.handshake.lock().unwrap().clone();
    assert!(stats.last_failure.unwrap().contains("anti-replay"));
    assert_eq!(stats.replay_counter, 1, "counter must not advance on replay");

    scenario.finish().await;
}

/// Compression: a 20-byte repetitive console payload goes out with the
/// compression flag, shorter than the original, and expands back exactly.
#[tokio::test]
async fn console_burst_is_compressed_on_the_wire() {
    let scenario = start(McuScript::default(), |_| {}).await;
    scenario.wait_synced().await;

    let burst = vec![b'A'; 20];
    let message = InboundMessage::new("br/console/in", burst.clone());
    assert!(scenario.router.dispatch(&message).await);

    let recorder = scenario.recorder.clone();
    wait_for(move || !recorder.recorded(Command::ConsoleWrite).is_empty()).await;

    // The scripted MCU already decompressed: payload must match exactly.
    assert_eq!(
        scenario.recorder.recorded(Command::ConsoleWrite),
        vec![burst]
    );
    // And the wire frame carried the compression flag.
    assert!(
        scenario
            .recorder
            .compressed
            .lock()
            .unwrap()
            .contains(&(Command::ConsoleWrite as u16))
    );

    scenario.finish().await;
}

/// Pin overflow: with a pending limit of 1, the second read is rejected
/// with a pending-pin-overflow event while the first stays queued.
#[tokio::test]
async fn pending_pin_overflow() {
    let scenario = start(
        McuScript {
            ignore_pin_reads: true,
            ..McuScript::default()
        },
        |config| config.pending_pin_request_limit = 1,
    )
    .await;
    scenario.wait_synced().await;
    let _ = scenario.drain_publishes();

    let read = InboundMessage::new("br/d/13/read", Vec::new());
    assert!(scenario.router.dispatch(&read).await);
    assert!(scenario.router.dispatch(&read).await);

    let overflow: Vec<QueuedPublish> = scenario
        .drain_publishes()
        .into_iter()
        .filter(|m| {
            m.user_properties
                .iter()
                .any(|(k, v)| k == "bridge-error" && v == "pending-pin-overflow")
        })
        .collect();
    assert_eq!(overflow.len(), 1);
    assert_eq!(overflow[0].topic, "br/d/13/value");

    // The first request went out and is still waiting.
    let recorder = scenario.recorder.clone();
    wait_for(move || !recorder.recorded(Command::DigitalRead).is_empty()).await;
    assert_eq!(scenario.ctx.state.pending_digital.lock().unwrap().len(), 1);

    scenario.finish().await;
}

/// Spool durability: with the broker unreachable the queue caps, the
/// spool holds the overflow window in order, and the excess is counted.
#[tokio::test]
async fn spool_absorbs_queue_overflow() {
    let scenario = start(McuScript::default(), |config| {
        config.mqtt_queue_limit = 2;
        config.mqtt_spool_limit = 5;
    })
    .await;

    for n in 0..10u8 {
        scenario
            .ctx
            .publish(QueuedPublish::new(format!("br/x/{n}"), vec![n]));
    }

    assert_eq!(scenario.ctx.state.mqtt_queue.lock().unwrap().len(), 2);
    assert_eq!(scenario.ctx.state.spool.len(), 5);
    assert_eq!(scenario.ctx.state.spool.dropped_limit(), 3);

    // Drain order across the spool stays FIFO.
    let restored = scenario.ctx.state.spool.drain();
    assert_eq!(restored.first().unwrap().topic, "br/x/5");
    assert_eq!(restored.last().unwrap().topic, "br/x/9");

    scenario.finish().await;
}

/// Baud negotiation: when target and safe rates differ the gateway sends
/// CMD_SET_BAUDRATE at the safe rate before handshaking.
#[tokio::test]
async fn baud_negotiation_runs_before_handshake() {
    let scenario = start(McuScript::default(), |config| {
        config.serial_baud = 250_000;
        config.serial_safe_baud = 115_200;
    })
    .await;
    scenario.wait_synced().await;

    assert_eq!(
        scenario.recorder.recorded(Command::SetBaudrate),
        vec![250_000u32.to_be_bytes().to_vec()]
    );
    // Negotiation session plus the live session.
    assert!(scenario.recorder.sessions.load(Ordering::SeqCst) >= 2);

    scenario.finish().await;
}

/// A full request/response round-trip through the flow controller after
/// link bring-up: the watchdog beat command is ACKed by the MCU.
#[tokio::test]
async fn keepalive_round_trip() {
    let scenario = start(McuScript::default(), |_| {}).await;
    scenario.wait_synced().await;

    let outcome = scenario.ctx.send_frame(Command::Keepalive, &[]).await;
    assert_eq!(outcome, SendOutcome::Success(None));
    assert_eq!(scenario.recorder.recorded(Command::Keepalive).len(), 1);

    scenario.finish().await;
}
