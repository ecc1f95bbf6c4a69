//! Connection management: one transport, one protocol session, one receive
//! loop, and the request/response machinery every high-level operation rides
//! on.
//!
//! [`DeviceLink`] owns the active [`Transport`] and [`Session`] pair. A
//! background task polls the transport with a short timeout, feeds whatever
//! arrives into the session, and dispatches each decoded frame: telemetry,
//! device-log and device-error frames fan out to subscribers, everything else
//! is treated as the reply to the one in-flight synchronous request.
//!
//! Replies carry no correlation the host currently uses, so only a single
//! request may be outstanding at a time; an internal command mutex enforces
//! that, and the pending "slot" is a queue-backed sink so a burst of
//! back-to-back reply frames (a chunked configuration download, say) cannot
//! overwrite itself.
//!
//! Protocol-level failures — timeouts, nacks, malformed replies — surface as
//! `None`/`false` returns, never as panics or errors; the receive loop shrugs
//! off anything the codec rejects.

use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::protocol::{self, Frame, MessageType, Session};
use crate::telemetry::{DeviceInfo, TelemetryFrame};
#[cfg(feature = "serial")]
use crate::transport::serial::SerialLink;
use crate::transport::{
    emulator::EmulatorLink, PortInfo, Transport, TransportEvent, TransportState,
};

/// How long the receive loop blocks on one transport read.
const RECEIVE_POLL: Duration = Duration::from_millis(100);
/// Default wait for a command's reply.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);
const PING_TIMEOUT: Duration = Duration::from_secs(1);
/// Flash writes are slow on real hardware.
const FLASH_TIMEOUT: Duration = Duration::from_secs(5);
/// Overall budget for a chunked configuration download, polled in slices.
const CONFIG_FETCH_BUDGET: Duration = Duration::from_secs(5);
const CONFIG_FETCH_SLICE: Duration = Duration::from_millis(500);
/// Bound on joining the receive loop during disconnect.
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Kind of the active connection. WiFi is reserved and not yet implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Serial,
    Emulator,
    Wifi,
}

/// Asynchronous notifications fanned out to subscribers.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Telemetry(TelemetryFrame),
    /// Device-side log line: severity byte plus UTF-8 text (lossily decoded).
    Log { level: u8, message: String },
    /// Device-reported or transport-level error, formatted for display.
    DeviceError(String),
    State(TransportState),
}

/// Snapshot of the connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub last_ping_ms: f64,
}

/// Counter storage. Sender tasks and the receive loop update these
/// concurrently, so everything is atomic.
#[derive(Default)]
struct StatsInner {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    errors: AtomicU64,
    last_ping_us: AtomicU64,
}

impl StatsInner {
    fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_ping_ms: self.last_ping_us.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }

    fn reset(&self) {
        self.packets_sent.store(0, Ordering::Relaxed);
        self.packets_received.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.last_ping_us.store(0, Ordering::Relaxed);
    }
}

type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;
type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<DeviceEvent>>>>;
type ReplySink = Arc<Mutex<Option<mpsc::UnboundedSender<Frame>>>>;

/// Everything the receive loop needs, detached from `DeviceLink` itself.
struct ReceiveContext {
    transport: SharedTransport,
    session: Arc<Mutex<Session>>,
    running: Arc<AtomicBool>,
    stats: Arc<StatsInner>,
    subscribers: Subscribers,
    reply_sink: ReplySink,
}

/// High-level connection manager for one dashboard device.
pub struct DeviceLink {
    transport: Option<SharedTransport>,
    connection_kind: Option<ConnectionKind>,
    session: Arc<Mutex<Session>>,
    device_info: Arc<Mutex<Option<DeviceInfo>>>,
    stats: Arc<StatsInner>,
    subscribers: Subscribers,
    reply_sink: ReplySink,
    /// Serializes high-level operations: replies are matched to requests only
    /// by arrival order, so exactly one request may be in flight.
    command_gate: tokio::sync::Mutex<()>,
    running: Arc<AtomicBool>,
    receive_task: Option<tokio::task::JoinHandle<()>>,
    event_task: Option<tokio::task::JoinHandle<()>>,
}

impl DeviceLink {
    pub fn new() -> Self {
        Self {
            transport: None,
            connection_kind: None,
            session: Arc::new(Mutex::new(Session::new())),
            device_info: Arc::new(Mutex::new(None)),
            stats: Arc::new(StatsInner::default()),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            reply_sink: Arc::new(Mutex::new(None)),
            command_gate: tokio::sync::Mutex::new(()),
            running: Arc::new(AtomicBool::new(false)),
            receive_task: None,
            event_task: None,
        }
    }

    /// List serial ports visible on this machine.
    #[cfg(feature = "serial")]
    pub fn list_serial_ports() -> Vec<PortInfo> {
        SerialLink::list_ports()
    }

    /// List every connectable endpoint, hardware and emulated.
    pub fn list_all_connections() -> Vec<PortInfo> {
        let mut connections = Vec::new();
        #[cfg(feature = "serial")]
        connections.extend(SerialLink::list_ports());
        connections.extend(EmulatorLink::list_ports());
        connections
    }

    /// Register for telemetry, device-log, error and state events. Each
    /// subscriber gets its own queue; one going away never affects another.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DeviceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .push(tx);
        rx
    }

    pub fn is_connected(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| {
            t.lock()
                .expect("transport mutex poisoned")
                .is_connected()
        })
    }

    pub fn connection_kind(&self) -> Option<ConnectionKind> {
        self.connection_kind
    }

    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.device_info
            .lock()
            .expect("device info poisoned")
            .clone()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.snapshot()
    }

    /// Connect to dashboard hardware over a serial port. With `port` unset
    /// the transport auto-detects one. Any existing connection is torn down
    /// first.
    #[cfg(feature = "serial")]
    pub async fn connect_serial(&mut self, port: Option<&str>, baud_rate: u32) -> bool {
        let link = SerialLink::new(port.map(str::to_owned), baud_rate);
        self.connect(Box::new(link), ConnectionKind::Serial).await
    }

    /// Connect to the in-process emulated dashboard.
    pub async fn connect_emulator(&mut self) -> bool {
        self.connect(Box::new(EmulatorLink::new()), ConnectionKind::Emulator)
            .await
    }

    /// Connect over a caller-supplied transport. This is the primitive under
    /// [`Self::connect_serial`] and [`Self::connect_emulator`], and the hook
    /// test doubles plug into.
    pub async fn connect(&mut self, mut transport: Box<dyn Transport>, kind: ConnectionKind) -> bool {
        if self.transport.is_some() {
            self.disconnect().await;
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        transport.set_event_sender(event_tx);
        self.event_task = Some(tokio::spawn(forward_transport_events(
            event_rx,
            self.subscribers.clone(),
            self.stats.clone(),
        )));

        let transport: SharedTransport = Arc::new(Mutex::new(transport));
        let connected = {
            let transport = transport.clone();
            tokio::task::spawn_blocking(move || {
                transport.lock().expect("transport mutex poisoned").connect()
            })
            .await
            .unwrap_or(false)
        };
        if !connected {
            // The transport (with its event sender) drops here, which ends
            // the forwarder task on its own.
            self.event_task.take();
            return false;
        }

        *self.session.lock().expect("session mutex poisoned") = Session::new();
        self.transport = Some(transport.clone());
        self.connection_kind = Some(kind);
        self.running.store(true, Ordering::SeqCst);

        let ctx = ReceiveContext {
            transport,
            session: self.session.clone(),
            running: self.running.clone(),
            stats: self.stats.clone(),
            subscribers: self.subscribers.clone(),
            reply_sink: self.reply_sink.clone(),
        };
        self.receive_task = Some(tokio::task::spawn_blocking(move || receive_loop(ctx)));

        if !self.fetch_device_info().await {
            warn!("device info exchange failed");
        }
        true
    }

    /// Disconnect and reset per-connection state. The receive loop is asked
    /// to stop and joined with a bounded wait so a wedged transport read
    /// cannot hang shutdown; a concurrent request simply times out.
    pub async fn disconnect(&mut self) {
        let Some(transport) = self.transport.take() else {
            return;
        };
        info!("disconnecting from device");
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.receive_task.take() {
            if timeout(JOIN_TIMEOUT, task).await.is_err() {
                warn!("receive loop did not stop within {:?}", JOIN_TIMEOUT);
            }
        }
        {
            let transport = transport.clone();
            let _ = tokio::task::spawn_blocking(move || {
                transport
                    .lock()
                    .expect("transport mutex poisoned")
                    .disconnect()
            })
            .await;
        }
        // Dropping the transport closes its event channel and the forwarder
        // task with it.
        drop(transport);
        self.event_task.take();
        self.connection_kind = None;
        *self.device_info.lock().expect("device info poisoned") = None;
        self.stats.reset();
    }

    /// Time a PING/PONG exchange. Returns the round trip in milliseconds.
    pub async fn ping(&self) -> Option<f64> {
        let _gate = self.command_gate.lock().await;
        let data = self
            .session
            .lock()
            .expect("session mutex poisoned")
            .create_ping();
        let start = Instant::now();
        let reply = self.request(data, PING_TIMEOUT).await?;
        if reply.message_type != MessageType::Pong {
            return None;
        }
        let rtt_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.stats
            .last_ping_us
            .store((rtt_ms * 1000.0) as u64, Ordering::Relaxed);
        Some(rtt_ms)
    }

    /// Download the device configuration, reassembling its chunked reply.
    pub async fn get_configuration(&self) -> Option<Vec<u8>> {
        let _gate = self.command_gate.lock().await;
        let data = self
            .session
            .lock()
            .expect("session mutex poisoned")
            .create_get_config();

        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.reply_sink.lock().expect("reply sink poisoned") = Some(tx);
        if !self.send_raw(&data).await {
            *self.reply_sink.lock().expect("reply sink poisoned") = None;
            return None;
        }

        let deadline = Instant::now() + CONFIG_FETCH_BUDGET;
        let mut result = None;
        while Instant::now() < deadline {
            match timeout(CONFIG_FETCH_SLICE, rx.recv()).await {
                Ok(Some(frame)) if frame.message_type == MessageType::ConfigChunk => {
                    let complete = self
                        .session
                        .lock()
                        .expect("session mutex poisoned")
                        .process_config_chunk(&frame.payload);
                    if let Some(config) = complete {
                        result = Some(config);
                        break;
                    }
                }
                Ok(Some(frame)) => {
                    debug!(
                        "ignoring {:?} while collecting config chunks",
                        frame.message_type
                    );
                }
                Ok(None) => break,
                Err(_) => {}
            }
        }
        *self.reply_sink.lock().expect("reply sink poisoned") = None;
        if result.is_none() {
            warn!("configuration download timed out");
        }
        result
    }

    /// Upload a configuration, one acknowledged chunk at a time. Aborts on
    /// the first missing or wrong ack.
    pub async fn set_configuration(&self, config: &[u8]) -> bool {
        let _gate = self.command_gate.lock().await;
        let frames = self
            .session
            .lock()
            .expect("session mutex poisoned")
            .create_set_config(config);
        for data in frames {
            match self.request(data, COMMAND_TIMEOUT).await {
                Some(reply) if reply.message_type == MessageType::ConfigChunkAck => {}
                Some(reply) => {
                    error!(
                        "config chunk answered with {:?} instead of an ack",
                        reply.message_type
                    );
                    return false;
                }
                None => {
                    error!("config chunk not acknowledged");
                    return false;
                }
            }
        }
        info!("configuration sent ({} bytes)", config.len());
        true
    }

    /// Ask the device to stream telemetry at `rate_hz`.
    pub async fn subscribe_telemetry(&self, rate_hz: u16) -> bool {
        let _gate = self.command_gate.lock().await;
        let data = self
            .session
            .lock()
            .expect("session mutex poisoned")
            .create_subscribe_telemetry(rate_hz);
        self.expect_reply(data, MessageType::Ack, COMMAND_TIMEOUT)
            .await
    }

    pub async fn unsubscribe_telemetry(&self) -> bool {
        let _gate = self.command_gate.lock().await;
        let data = self
            .session
            .lock()
            .expect("session mutex poisoned")
            .create_unsubscribe_telemetry();
        self.expect_reply(data, MessageType::Ack, COMMAND_TIMEOUT)
            .await
    }

    /// Write one output channel on the device.
    pub async fn set_channel(&self, channel_id: u16, value: u32) -> bool {
        let _gate = self.command_gate.lock().await;
        let data = self
            .session
            .lock()
            .expect("session mutex poisoned")
            .create_set_channel(channel_id, value);
        self.expect_reply(data, MessageType::ChannelAck, COMMAND_TIMEOUT)
            .await
    }

    /// Persist the device's current configuration to flash.
    pub async fn save_to_flash(&self) -> bool {
        let _gate = self.command_gate.lock().await;
        let data = self
            .session
            .lock()
            .expect("session mutex poisoned")
            .create_save_to_flash();
        self.expect_reply(data, MessageType::Ack, FLASH_TIMEOUT).await
    }

    /// Fire-and-forget device restart; no ack is awaited because the device
    /// reboots out from under the link.
    pub async fn restart_device(&self) -> bool {
        let _gate = self.command_gate.lock().await;
        let data = self
            .session
            .lock()
            .expect("session mutex poisoned")
            .create_restart();
        self.send_raw(&data).await
    }

    async fn fetch_device_info(&self) -> bool {
        let _gate = self.command_gate.lock().await;
        let data = self
            .session
            .lock()
            .expect("session mutex poisoned")
            .create_get_info();
        let Some(reply) = self.request(data, COMMAND_TIMEOUT).await else {
            return false;
        };
        if reply.message_type != MessageType::InfoResponse {
            warn!("get_info answered with {:?}", reply.message_type);
            return false;
        }
        match DeviceInfo::parse(&reply.payload) {
            Some(parsed) => {
                info!(
                    "device info: fw {} serial {} hw {}",
                    parsed.firmware_version, parsed.serial_number, parsed.hardware_version
                );
                *self.device_info.lock().expect("device info poisoned") = Some(parsed);
                true
            }
            None => {
                warn!(
                    "malformed device info payload ({} bytes)",
                    reply.payload.len()
                );
                false
            }
        }
    }

    /// Send a frame and wait for the expected ack type.
    async fn expect_reply(&self, data: Vec<u8>, expected: MessageType, wait: Duration) -> bool {
        match self.request(data, wait).await {
            Some(reply) if reply.message_type == expected => true,
            Some(reply) => {
                warn!("expected {:?}, device sent {:?}", expected, reply.message_type);
                false
            }
            None => false,
        }
    }

    /// The synchronous request primitive: install a fresh reply sink, send,
    /// and wait out the reply or the timeout. Callers hold the command gate.
    async fn request(&self, data: Vec<u8>, wait: Duration) -> Option<Frame> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Installing a new sink also discards any stale reply from a previous
        // timed-out request.
        *self.reply_sink.lock().expect("reply sink poisoned") = Some(tx);
        if !self.send_raw(&data).await {
            *self.reply_sink.lock().expect("reply sink poisoned") = None;
            return None;
        }
        let reply = match timeout(wait, rx.recv()).await {
            Ok(frame) => frame,
            Err(_) => None,
        };
        *self.reply_sink.lock().expect("reply sink poisoned") = None;
        reply
    }

    /// Push raw bytes through the transport, updating the sent counters.
    async fn send_raw(&self, data: &[u8]) -> bool {
        let Some(transport) = self.transport.clone() else {
            warn!("send with no active transport");
            return false;
        };
        let bytes = data.to_vec();
        let sent = tokio::task::spawn_blocking(move || {
            transport
                .lock()
                .expect("transport mutex poisoned")
                .send(&bytes)
        })
        .await
        .unwrap_or(false);
        if sent {
            self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
            self.stats
                .bytes_sent
                .fetch_add(data.len() as u64, Ordering::Relaxed);
        }
        sent
    }
}

impl Default for DeviceLink {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        // Stop a still-running receive loop; it re-checks this flag after
        // every poll.
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Bridge transport state/error events into the subscriber fan-out. Ends on
/// its own when the transport (and its sender) is dropped.
async fn forward_transport_events(
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
    subscribers: Subscribers,
    stats: Arc<StatsInner>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            TransportEvent::StateChanged(state) => {
                publish(&subscribers, DeviceEvent::State(state));
            }
            TransportEvent::Error(message) => {
                stats.errors.fetch_add(1, Ordering::Relaxed);
                publish(&subscribers, DeviceEvent::DeviceError(message));
            }
        }
    }
}

/// Deliver one event to every live subscriber, pruning dead ones. A failed
/// delivery only ever costs that subscriber its registration.
fn publish(subscribers: &Subscribers, event: DeviceEvent) {
    let mut subs = subscribers.lock().expect("subscriber list poisoned");
    subs.retain(|tx| {
        if tx.send(event.clone()).is_ok() {
            true
        } else {
            debug!("removing closed event subscriber");
            false
        }
    });
}

/// Background loop: poll the transport, feed the session, dispatch frames.
/// Runs on the blocking pool for the lifetime of one connection.
fn receive_loop(ctx: ReceiveContext) {
    debug!("receive loop started");
    while ctx.running.load(Ordering::SeqCst) {
        let data = {
            ctx.transport
                .lock()
                .expect("transport mutex poisoned")
                .receive(RECEIVE_POLL)
        };
        let Some(data) = data else { continue };
        if data.is_empty() {
            continue;
        }
        ctx.stats
            .bytes_received
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        let frames = ctx
            .session
            .lock()
            .expect("session mutex poisoned")
            .feed(&data);
        for frame in frames {
            ctx.stats.packets_received.fetch_add(1, Ordering::Relaxed);
            dispatch_frame(&ctx, frame);
        }
    }
    debug!("receive loop stopped");
}

/// Route one decoded frame: streaming types fan out, everything else is a
/// synchronous reply candidate.
fn dispatch_frame(ctx: &ReceiveContext, frame: Frame) {
    match frame.message_type {
        MessageType::TelemetryData => {
            let telemetry = TelemetryFrame::parse(&frame.payload);
            publish(&ctx.subscribers, DeviceEvent::Telemetry(telemetry));
        }
        MessageType::LogMessage => {
            let Some((&level, text)) = frame.payload.split_first() else {
                debug!("empty log frame dropped");
                return;
            };
            let message = String::from_utf8_lossy(text).into_owned();
            publish(&ctx.subscribers, DeviceEvent::Log { level, message });
        }
        MessageType::Error => {
            let (code, message) = protocol::parse_error(&frame.payload);
            ctx.stats.errors.fetch_add(1, Ordering::Relaxed);
            publish(
                &ctx.subscribers,
                DeviceEvent::DeviceError(format!("device error {:?}: {}", code, message)),
            );
        }
        _ => {
            let sink = ctx.reply_sink.lock().expect("reply sink poisoned");
            match sink.as_ref() {
                Some(tx) => {
                    // A receiver dropped after its timeout is fine; the reply
                    // is stale either way.
                    let _ = tx.send(frame);
                }
                None => debug!("unsolicited {:?} reply dropped", frame.message_type),
            }
        }
    }
}
