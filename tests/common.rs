//! Shared test doubles: a scripted transport that answers decoded frames
//! through a caller-supplied responder.

use std::time::Duration;
use tokio::sync::mpsc;

use dashlink::protocol::{encode_frame, Frame, MessageType, Session};
use dashlink::telemetry::DeviceInfo;
use dashlink::transport::{Transport, TransportEvent, TransportState};

pub type Responder = Box<dyn FnMut(&Frame) -> Vec<Frame> + Send>;

/// Transport double: frames written with `send` are decoded and handed to the
/// responder; whatever it returns is queued, encoded, for `receive`.
pub struct ScriptedTransport {
    session: Session,
    rx: Vec<u8>,
    responder: Responder,
    state: TransportState,
}

impl ScriptedTransport {
    pub fn new(responder: impl FnMut(&Frame) -> Vec<Frame> + Send + 'static) -> Self {
        Self {
            session: Session::new(),
            rx: Vec::new(),
            responder: Box::new(responder),
            state: TransportState::Disconnected,
        }
    }
}

impl Transport for ScriptedTransport {
    fn connect(&mut self) -> bool {
        self.state = TransportState::Connected;
        true
    }

    fn disconnect(&mut self) {
        self.state = TransportState::Disconnected;
    }

    fn send(&mut self, data: &[u8]) -> bool {
        for frame in self.session.feed(data) {
            for reply in (self.responder)(&frame) {
                self.rx.extend_from_slice(&encode_frame(&reply));
            }
        }
        true
    }

    fn receive(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        if self.rx.is_empty() {
            std::thread::sleep(timeout.min(Duration::from_millis(10)));
            return None;
        }
        Some(std::mem::take(&mut self.rx))
    }

    fn state(&self) -> TransportState {
        self.state
    }

    fn set_event_sender(&mut self, _sender: mpsc::UnboundedSender<TransportEvent>) {}
}

/// Canned INFO_RESPONSE so connecting through a scripted transport completes
/// its identity exchange promptly.
pub fn info_reply(sequence: u8) -> Frame {
    let info = DeviceInfo {
        firmware_version: "9.9.9-test".to_string(),
        serial_number: "TEST-0001".to_string(),
        hardware_version: "t1".to_string(),
    };
    Frame::new(MessageType::InfoResponse, sequence, info.to_wire())
}

/// Build a CONFIG_CHUNK frame carrying the 5-byte chunk header plus `data`.
pub fn config_chunk(idx: u16, total: u16, compressed: bool, data: &[u8], sequence: u8) -> Frame {
    let mut payload = Vec::with_capacity(5 + data.len());
    payload.extend_from_slice(&idx.to_le_bytes());
    payload.extend_from_slice(&total.to_le_bytes());
    payload.push(u8::from(compressed));
    payload.extend_from_slice(data);
    Frame::new(MessageType::ConfigChunk, sequence, payload)
}
