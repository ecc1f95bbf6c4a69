//! Byte transports for the dashboard link.
//!
//! A [`Transport`] moves raw bytes to and from one device and tracks a small
//! connection state machine. Framing, checksums and request/response pairing
//! all live above this layer, so implementations stay dumb byte pumps: the
//! real serial port in [`serial`], an in-process device double in
//! [`emulator`].
//!
//! State changes and transport errors are pushed to whoever owns the
//! transport through an event channel rather than direct callbacks, so a slow
//! or dropped consumer can never stall a read or write.

use log::{debug, error};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

pub mod emulator;
#[cfg(feature = "serial")]
pub mod serial;

/// Connection state machine.
///
/// `Disconnected -> Connecting -> Connected`, with `Error` reachable from any
/// state on a failed connect or a mid-session I/O failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Out-of-band notifications from a transport to its owner.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(TransportState),
    Error(String),
}

/// One discoverable port/connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortInfo {
    pub port: String,
    pub description: String,
    pub hardware_id: String,
    pub manufacturer: String,
    /// True when the USB identifiers match dashboard hardware.
    pub is_dashboard: bool,
}

/// A byte-oriented link to one device.
///
/// Connection parameters are fixed at construction of the concrete type;
/// `connect` only performs the attempt. `send` and `receive` report failure
/// in-band (`false` / `None`) — the details travel on the event channel.
pub trait Transport: Send {
    fn connect(&mut self) -> bool;
    fn disconnect(&mut self);
    /// Write a full buffer. Returns false on any short or failed write.
    fn send(&mut self, data: &[u8]) -> bool;
    /// Block up to `timeout` for the next chunk of bytes, `None` on timeout.
    fn receive(&mut self, timeout: Duration) -> Option<Vec<u8>>;
    fn state(&self) -> TransportState;
    fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }
    /// Install the channel that carries state changes and error reports.
    fn set_event_sender(&mut self, sender: mpsc::UnboundedSender<TransportEvent>);
}

/// State + event plumbing shared by transport implementations.
#[derive(Debug, Default)]
pub(crate) struct TransportCore {
    state: TransportState,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
}

impl TransportCore {
    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn set_state(&mut self, state: TransportState) {
        if state != self.state {
            debug!("transport state: {} -> {}", self.state, state);
            self.state = state;
            if let Some(tx) = &self.events {
                let _ = tx.send(TransportEvent::StateChanged(state));
            }
        }
    }

    pub fn report_error(&self, message: impl Into<String>) {
        let message = message.into();
        error!("transport error: {}", message);
        if let Some(tx) = &self.events {
            let _ = tx.send(TransportEvent::Error(message));
        }
    }

    pub fn set_event_sender(&mut self, sender: mpsc::UnboundedSender<TransportEvent>) {
        self.events = Some(sender);
    }
}
