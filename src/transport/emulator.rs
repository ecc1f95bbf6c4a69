//! Emulated dashboard for development and testing without hardware.
//!
//! [`EmulatorLink`] answers the same protocol a real device speaks: frames
//! written with `send` are decoded in-process and the replies (plus any
//! subscribed telemetry stream) surface through `receive`, byte-exact with
//! what a serial port would deliver.

use log::{debug, info, warn};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use super::{PortInfo, Transport, TransportCore, TransportEvent, TransportState};
use crate::protocol::{encode_frame, Frame, MessageType, Session, CHUNK_SIZE};
use crate::telemetry::{DeviceInfo, TelemetryFrame};

const DEFAULT_TELEMETRY_RATE_HZ: u16 = 50;

/// State shared with the telemetry generator thread.
struct EmulatorShared {
    running: AtomicBool,
    telemetry_rate_hz: AtomicU32,
    /// Device-to-host bytes awaiting `receive`.
    rx: Mutex<Vec<u8>>,
    /// The device's stored configuration blob.
    config: Mutex<Vec<u8>>,
}

/// In-process dashboard double implementing [`Transport`].
pub struct EmulatorLink {
    core: TransportCore,
    session: Session,
    shared: Arc<EmulatorShared>,
    telemetry_thread: Option<JoinHandle<()>>,
}

impl EmulatorLink {
    pub fn new() -> Self {
        Self {
            core: TransportCore::default(),
            session: Session::new(),
            shared: Arc::new(EmulatorShared {
                running: AtomicBool::new(false),
                telemetry_rate_hz: AtomicU32::new(0),
                rx: Mutex::new(Vec::new()),
                config: Mutex::new(b"{}".to_vec()),
            }),
            telemetry_thread: None,
        }
    }

    /// The single virtual connection the emulator offers.
    pub fn list_ports() -> Vec<PortInfo> {
        vec![PortInfo {
            port: "emulator".to_string(),
            description: "Racing Dashboard Emulator".to_string(),
            hardware_id: "EMU".to_string(),
            manufacturer: "Emulator".to_string(),
            is_dashboard: true,
        }]
    }

    fn push(&self, frame: Frame) {
        let mut rx = self.shared.rx.lock().expect("emulator rx buffer poisoned");
        rx.extend_from_slice(&encode_frame(&frame));
    }

    fn process_frame(&mut self, frame: Frame) {
        let seq = frame.sequence;
        match frame.message_type {
            MessageType::Ping => self.push(Frame::empty(MessageType::Pong, seq)),
            MessageType::GetInfo => self.push(Frame::new(
                MessageType::InfoResponse,
                seq,
                emulated_device_info().to_wire(),
            )),
            MessageType::GetConfig => {
                let config = self
                    .shared
                    .config
                    .lock()
                    .expect("emulator config poisoned")
                    .clone();
                for chunk in config_chunk_frames(&config, seq) {
                    self.push(chunk);
                }
            }
            MessageType::ConfigChunk => {
                if let Some(complete) = self.session.process_config_chunk(&frame.payload) {
                    info!("emulator stored {} byte configuration", complete.len());
                    *self.shared.config.lock().expect("emulator config poisoned") = complete;
                }
                self.push(Frame::empty(MessageType::ConfigChunkAck, seq));
            }
            MessageType::SubscribeTelemetry => {
                let rate = frame
                    .payload
                    .get(..2)
                    .map(|b| u16::from_le_bytes([b[0], b[1]]))
                    .unwrap_or(DEFAULT_TELEMETRY_RATE_HZ);
                debug!("emulator telemetry subscription at {} Hz", rate);
                self.shared
                    .telemetry_rate_hz
                    .store(u32::from(rate), Ordering::SeqCst);
                self.push(Frame::empty(MessageType::Ack, seq));
            }
            MessageType::UnsubscribeTelemetry => {
                self.shared.telemetry_rate_hz.store(0, Ordering::SeqCst);
                self.push(Frame::empty(MessageType::Ack, seq));
            }
            MessageType::SetChannel => {
                if frame.payload.len() >= 6 {
                    let channel_id = u16::from_le_bytes([frame.payload[0], frame.payload[1]]);
                    let value = u32::from_le_bytes([
                        frame.payload[2],
                        frame.payload[3],
                        frame.payload[4],
                        frame.payload[5],
                    ]);
                    debug!("emulator set channel {} = {}", channel_id, value);
                }
                self.push(Frame::empty(MessageType::ChannelAck, seq));
            }
            MessageType::SaveToFlash => {
                // Flash writes on the real device take a beat.
                thread::sleep(Duration::from_millis(50));
                self.push(Frame::empty(MessageType::Ack, seq));
            }
            MessageType::RestartDevice => {
                info!("emulator simulating device restart");
                self.shared.telemetry_rate_hz.store(0, Ordering::SeqCst);
                self.push(Frame::empty(MessageType::Ack, seq));
            }
            other => debug!("emulator ignoring {:?}", other),
        }
    }

    fn stop_worker(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.telemetry_rate_hz.store(0, Ordering::SeqCst);
        if let Some(handle) = self.telemetry_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Default for EmulatorLink {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for EmulatorLink {
    fn connect(&mut self) -> bool {
        if self.core.state() == TransportState::Connected {
            return true;
        }
        info!("connecting to emulator");
        self.core.set_state(TransportState::Connecting);
        // Simulated link bring-up delay.
        thread::sleep(Duration::from_millis(150));

        self.shared.running.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        self.telemetry_thread = Some(thread::spawn(move || telemetry_loop(shared)));

        self.core.set_state(TransportState::Connected);
        info!("emulator connected");
        true
    }

    fn disconnect(&mut self) {
        if self.core.state() == TransportState::Disconnected {
            return;
        }
        info!("disconnecting emulator");
        self.stop_worker();
        self.core.set_state(TransportState::Disconnected);
    }

    fn send(&mut self, data: &[u8]) -> bool {
        if !self.is_connected() {
            warn!("emulator send while disconnected");
            return false;
        }
        for frame in self.session.feed(data) {
            self.process_frame(frame);
        }
        true
    }

    fn receive(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut rx = self.shared.rx.lock().expect("emulator rx buffer poisoned");
                if !rx.is_empty() {
                    return Some(std::mem::take(&mut *rx));
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn state(&self) -> TransportState {
        self.core.state()
    }

    fn set_event_sender(&mut self, sender: mpsc::UnboundedSender<TransportEvent>) {
        self.core.set_event_sender(sender);
    }
}

impl Drop for EmulatorLink {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

fn emulated_device_info() -> DeviceInfo {
    DeviceInfo {
        firmware_version: "2.0.0-emu".to_string(),
        serial_number: "EMU-12345".to_string(),
        hardware_version: "v1.0".to_string(),
    }
}

/// Split the stored configuration into uncompressed CONFIG_CHUNK frames.
fn config_chunk_frames(config: &[u8], sequence: u8) -> Vec<Frame> {
    let total = ((config.len() + CHUNK_SIZE - 1) / CHUNK_SIZE).max(1);
    (0..total)
        .map(|idx| {
            let begin = idx * CHUNK_SIZE;
            let end = ((idx + 1) * CHUNK_SIZE).min(config.len());
            let mut payload = Vec::with_capacity(5 + end - begin);
            payload.extend_from_slice(&(idx as u16).to_le_bytes());
            payload.extend_from_slice(&(total as u16).to_le_bytes());
            payload.push(0);
            payload.extend_from_slice(&config[begin..end]);
            Frame::new(MessageType::ConfigChunk, sequence, payload)
        })
        .collect()
}

fn telemetry_loop(shared: Arc<EmulatorShared>) {
    let mut sim = Simulation::default();
    let mut rng = rand::thread_rng();
    while shared.running.load(Ordering::SeqCst) {
        let rate = shared.telemetry_rate_hz.load(Ordering::SeqCst);
        if rate == 0 {
            thread::sleep(Duration::from_millis(50));
            continue;
        }
        let interval = Duration::from_secs_f64(1.0 / f64::from(rate));
        thread::sleep(interval);
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
        let telemetry = sim.step(interval.as_secs_f64(), &mut rng);
        let frame = Frame::new(MessageType::TelemetryData, 0, telemetry.to_wire());
        let mut rx = shared.rx.lock().expect("emulator rx buffer poisoned");
        rx.extend_from_slice(&encode_frame(&frame));
    }
}

/// Plausible-looking vehicle behavior: rpm oscillates, speed chases rpm,
/// throttle and brake trade off on a ten-second cycle.
#[derive(Default)]
struct Simulation {
    time: f64,
    speed: f64,
}

impl Simulation {
    fn step(&mut self, dt: f64, rng: &mut impl Rng) -> TelemetryFrame {
        self.time += dt;

        let rpm = 3500.0 + 2000.0 * (self.time % 1.0) + rng.gen_range(-50.0..50.0);
        let target_speed = (rpm - 1000.0) / 50.0;
        self.speed += (target_speed - self.speed) * 0.1;

        let phase = (self.time % 10.0) / 10.0;
        let (throttle, brake) = if phase < 0.6 {
            ((60.0 + 40.0 * phase) as u8, 0u8)
        } else {
            (0u8, (100.0 * (1.0 - (phase - 0.6) / 0.4)) as u8)
        };

        let g_longitudinal = if brake > 50 {
            -1.2 * f32::from(brake) / 100.0
        } else {
            0.3 * f32::from(throttle) / 100.0
        };

        let gear = match self.speed.max(0.0) as u16 {
            0..=19 => 1,
            20..=39 => 2,
            40..=69 => 3,
            70..=99 => 4,
            100..=139 => 5,
            _ => 6,
        };

        TelemetryFrame {
            timestamp_ms: (self.time * 1000.0) as u32,
            rpm: rpm.clamp(0.0, 20_000.0) as u16,
            speed_kmh: self.speed.max(0.0) as u16,
            gear,
            throttle_percent: throttle,
            brake_percent: brake,
            coolant_temp_c: (85.0 + 5.0 * ((self.time % 60.0) / 60.0)) as i8,
            oil_temp_c: (90.0 + 8.0 * ((self.time % 120.0) / 120.0)) as i8,
            fuel_level_percent: 75,
            g_lateral: rng.gen_range(-0.5..0.5),
            g_longitudinal,
            lap_time_ms: ((self.time * 1000.0) as u32) % 120_000,
            ..Default::default()
        }
    }
}
