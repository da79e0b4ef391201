//! Serial transport: port lifecycle, read loop, baud negotiation, and the
//! per-connection handshake.
//!
//! The transport owns the OS serial handle behind a [`PortFactory`] seam so
//! tests drive it with in-memory duplex pipes. One connection cycle:
//!
//! 1. open the port (negotiating the target baud from the safe baud when
//!    they differ, up to three attempts, falling back to safe),
//! 2. run the authenticated handshake ([`crate::rpc::handshake`]),
//! 3. pump inbound bytes: split packets on the 0x00 delimiter, COBS-decode,
//!    parse, decompress, then offer each frame to the flow controller and
//!    otherwise dispatch to the service bridge **in receive order**.
//!
//! EOF, write failures, and reader errors tear the connection down; the
//! transport sleeps `reconnect_delay` and starts over. Handshake failures
//! past the fatal threshold propagate and stop the daemon.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_serial::SerialPortBuilderExt;
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::rpc::flow::{FlowController, SendOutcome};
use crate::rpc::frame::{self, FrameError};
use crate::rpc::handshake::{HandshakeError, HandshakeManager};
use crate::rpc::protocol::{CMD_FLAG_COMPRESSED, CMD_ID_MASK, Command};
use crate::rpc::{rle, wire};
use crate::services::Bridge;
use crate::state::{RuntimeState, unix_now};

const BAUD_NEGOTIATION_ATTEMPTS: u32 = 3;

/// Byte stream of an open serial connection.
pub trait SerialIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> SerialIo for T {}

pub type SerialStreamBox = Box<dyn SerialIo>;

/// Seam for opening the link at a given baud rate.
pub trait PortFactory: Send + Sync {
    fn open(&self, baud: u32) -> std::io::Result<SerialStreamBox>;
}

/// Real TTY factory over tokio-serial.
pub struct TtyFactory {
    path: String,
}

impl TtyFactory {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl PortFactory for TtyFactory {
    fn open(&self, baud: u32) -> std::io::Result<SerialStreamBox> {
        let mut stream = tokio_serial::new(&self.path, baud)
            .open_native_async()
            .map_err(std::io::Error::other)?;
        #[cfg(unix)]
        if let Err(err) = stream.set_exclusive(false) {
            debug!("serial: cannot clear exclusive mode: {err}");
        }
        Ok(Box::new(stream))
    }
}

pub struct SerialTransport {
    config: Arc<BridgeConfig>,
    state: Arc<RuntimeState>,
    flow: Arc<FlowController>,
    bridge: Arc<Bridge>,
    handshake: Mutex<HandshakeManager>,
    factory: Box<dyn PortFactory>,
    shutdown: CancellationToken,
}

impl SerialTransport {
    pub fn new(
        config: Arc<BridgeConfig>,
        state: Arc<RuntimeState>,
        flow: Arc<FlowController>,
        bridge: Arc<Bridge>,
        factory: Box<dyn PortFactory>,
        shutdown: CancellationToken,
    ) -> Self {
        let handshake = HandshakeManager::new(
            config.serial_shared_secret.as_bytes(),
            config.serial_handshake_fatal_failures,
            Duration::from_secs_f64(config.serial_handshake_min_interval),
        );
        Self {
            config,
            state,
            flow,
            bridge,
            handshake: Mutex::new(handshake),
            factory,
            shutdown,
        }
    }

    /// Connection loop: reconnects forever, surfaces only fatal errors.
    /// Runs under the supervisor.
    pub async fn run(&self) -> Result<()> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            match self.connect_once().await {
                Ok(()) => {}
                Err(BridgeError::Cancelled) => return Ok(()),
                Err(err) if err.is_fatal() => {
                    self.teardown().await;
                    return Err(err);
                }
                Err(err) => warn!("serial: connection ended: {err}"),
            }

            self.teardown().await;

            tokio::select! {
                () = tokio::time::sleep(self.config.reconnect_delay()) => {}
                () = self.shutdown.cancelled() => return Ok(()),
            }
        }
    }

    async fn teardown(&self) {
        self.flow.detach_writer().await;
        self.bridge.on_serial_disconnected().await;
    }

    /// One full connection: open, negotiate, handshake, serve.
    async fn connect_once(&self) -> Result<()> {
        let baud = self.negotiate_baud().await?;

        let mut session = self.open_session(baud).await?;
        info!("serial: link open at {} baud", baud);

        match self.perform_handshake().await {
            Ok(()) => {}
            Err(err) => {
                session.abort();
                return Err(err);
            }
        }

        self.bridge.on_serial_connected().await;
        info!("serial: link synchronised");

        tokio::select! {
            reader = &mut session.handle => match reader {
                Ok(result) => result,
                Err(_) => Ok(()),
            },
            () = self.flow.reconnect_requested() => {
                debug!("serial: reconnect requested");
                session.abort();
                Ok(())
            }
            () = self.shutdown.cancelled() => {
                session.abort();
                Err(BridgeError::Cancelled)
            }
        }
    }

    /// If the configured baud differs from the safe baud, ask the MCU to
    /// switch while connected at the safe rate. Falls back to the safe
    /// baud after three failed attempts.
    async fn negotiate_baud(&self) -> Result<u32> {
        let target = self.config.serial_baud;
        let safe = self.config.serial_safe_baud;
        if target == safe {
            return Ok(target);
        }

        for attempt in 1..=BAUD_NEGOTIATION_ATTEMPTS {
            if self.shutdown.is_cancelled() {
                return Err(BridgeError::Cancelled);
            }

            let session = self.open_session(safe).await?;
            let outcome = self
                .flow
                .send(Command::SetBaudrate, &target.to_be_bytes())
                .await;
            session.abort();
            self.flow.detach_writer().await;

            match outcome {
                SendOutcome::Success(_) => {
                    info!("serial: MCU accepted {} baud", target);
                    return Ok(target);
                }
                SendOutcome::Cancelled => return Err(BridgeError::Cancelled),
                other => {
                    warn!(
                        "serial: baud negotiation attempt {}/{} failed ({:?})",
                        attempt, BAUD_NEGOTIATION_ATTEMPTS, other
                    );
                }
            }
        }

        warn!("serial: negotiation failed, staying at safe baud {}", safe);
        Ok(safe)
    }

    /// Open the port, wire the write half into the flow controller, and
    /// spawn the read loop.
    async fn open_session(&self, baud: u32) -> Result<ReadSession> {
        let stream = self.factory.open(baud)?;
        let (read_half, write_half) = tokio::io::split(stream);
        self.flow.attach_writer(Box::new(write_half)).await;

        let flow = self.flow.clone();
        let bridge = self.bridge.clone();
        let state = self.state.clone();
        let handle = tokio::spawn(read_loop(read_half, flow, bridge, state));
        Ok(ReadSession { handle })
    }

    /// The authenticated link sync, with rate limiting and fatal
    /// escalation.
    async fn perform_handshake(&self) -> Result<()> {
        let throttle = self.handshake.lock().unwrap().throttle();
        if let Some(wait) = throttle {
            debug!("handshake: throttled for {:.1}s", wait.as_secs_f64());
            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = self.shutdown.cancelled() => return Err(BridgeError::Cancelled),
            }
        }

        let nonce = {
            let mut mgr = self.handshake.lock().unwrap();
            mgr.record_attempt();
            mgr.next_nonce()
        };
        self.state.handshake.lock().unwrap().attempts += 1;

        let result = self.handshake_exchange(&nonce).await;
        match result {
            Ok(()) => {
                let mut mgr = self.handshake.lock().unwrap();
                mgr.record_success();
                let mut stats = self.state.handshake.lock().unwrap();
                stats.consecutive_failures = 0;
                stats.last_success_unix = Some(unix_now());
                stats.replay_counter = mgr.last_accepted();
                Ok(())
            }
            Err(BridgeError::Handshake(err)) => {
                let escalated = self.handshake.lock().unwrap().record_failure(&err);
                {
                    let mut stats = self.state.handshake.lock().unwrap();
                    stats.failures += 1;
                    stats.consecutive_failures += 1;
                    stats.last_failure = Some(err.to_string());
                }
                match escalated {
                    Some(fatal) => Err(BridgeError::Handshake(fatal)),
                    None => Err(BridgeError::Handshake(err)),
                }
            }
            Err(other) => Err(other),
        }
    }

    async fn handshake_exchange(&self, nonce: &[u8; 16]) -> Result<()> {
        let response = match self.flow.send(Command::LinkSync, nonce).await {
            SendOutcome::Success(Some(payload)) => payload,
            SendOutcome::Cancelled => return Err(BridgeError::Cancelled),
            _ => return Err(HandshakeError::NoResponse.into()),
        };

        self.handshake
            .lock()
            .unwrap()
            .verify_response(nonce, &response)
            .map_err(BridgeError::Handshake)?;

        let ack_ms = (self.config.serial_retry_timeout * 1000.0) as u16;
        let response_ms = (self.config.serial_response_timeout * 1000.0) as u32;
        let link_config = HandshakeManager::build_link_config(
            ack_ms,
            self.config.serial_retry_attempts,
            response_ms,
        );
        match self.flow.send(Command::LinkConfig, &link_config).await {
            SendOutcome::Success(_) => Ok(()),
            SendOutcome::Cancelled => Err(BridgeError::Cancelled),
            _ => Err(HandshakeError::ConfigRejected.into()),
        }
    }
}

/// Handle on a spawned read loop.
struct ReadSession {
    handle: tokio::task::JoinHandle<Result<()>>,
}

impl ReadSession {
    fn abort(&self) {
        self.handle.abort();
    }
}

/// Pump inbound bytes until EOF or a read error. Frames are dispatched in
/// receive order; a handler's prologue completes before the next frame.
async fn read_loop(
    mut reader: impl AsyncRead + Send + Unpin,
    flow: Arc<FlowController>,
    bridge: Arc<Bridge>,
    state: Arc<RuntimeState>,
) -> Result<()> {
    let mut splitter = wire::PacketSplitter::new();
    let mut buf = [0u8; 1024];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("serial: EOF");
                return Ok(());
            }
            Ok(n) => n,
            Err(err) => {
                warn!("serial: read error: {err}");
                return Err(err.into());
            }
        };
        state
            .serial_bytes_in
            .fetch_add(n as u64, Ordering::Relaxed);

        // Collect packets first; dispatch outside the splitter borrow.
        let mut packets: Vec<Vec<u8>> = Vec::new();
        let before = splitter.oversize_drops();
        splitter.feed(&buf[..n], |packet| packets.push(packet.to_vec()));
        let oversize = splitter.oversize_drops() - before;
        if oversize > 0 {
            state
                .serial_errors
                .oversize_packets
                .fetch_add(oversize, Ordering::Relaxed);
        }

        for packet in packets {
            if let Some((command_id, payload)) = decode_packet(&packet, &state) {
                if flow.on_frame(command_id, &payload) {
                    continue;
                }
                bridge.handle_mcu_frame(command_id, payload).await;
            }
        }
    }
}

/// COBS-decode, parse, and decompress one packet. Errors are accounted and
/// swallowed; the frame is dropped.
fn decode_packet(packet: &[u8], state: &RuntimeState) -> Option<(u16, Vec<u8>)> {
    let raw = match wire::cobs_decode(packet) {
        Ok(raw) => raw,
        Err(err) => {
            debug!("serial: COBS error: {err}");
            state
                .serial_errors
                .decode_errors
                .fetch_add(1, Ordering::Relaxed);
            return None;
        }
    };

    let (wire_id, payload) = match frame::parse(&raw) {
        Ok(parsed) => parsed,
        Err(err @ FrameError::CrcMismatch { .. }) => {
            debug!("serial: {err}");
            state
                .serial_errors
                .crc_errors
                .fetch_add(1, Ordering::Relaxed);
            return None;
        }
        Err(err) => {
            debug!("serial: {err}");
            state
                .serial_errors
                .decode_errors
                .fetch_add(1, Ordering::Relaxed);
            return None;
        }
    };

    if wire_id & CMD_FLAG_COMPRESSED == 0 {
        return Some((wire_id, payload));
    }

    match rle::decode(&payload) {
        Ok(expanded) => Some((wire_id & CMD_ID_MASK, expanded)),
        Err(err) => {
            debug!("serial: RLE error: {err}");
            state
                .serial_errors
                .decode_errors
                .fetch_add(1, Ordering::Relaxed);
            None
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
