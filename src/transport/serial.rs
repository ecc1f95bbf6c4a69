//! USB serial transport for dashboard hardware.

use log::{info, trace, warn};
use std::io::{Read, Write};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{PortInfo, Transport, TransportCore, TransportEvent, TransportState};

/// Dashboard USB identifiers (STMicroelectronics virtual COM port).
pub const DASHBOARD_VID: u16 = 0x0483;
pub const DASHBOARD_PID: u16 = 0x5740;

const READ_CHUNK: usize = 1024;

/// Serial link to a physical dashboard.
///
/// With no port name given, `connect` prefers a port whose USB identifiers
/// match dashboard hardware and falls back to the first available port.
pub struct SerialLink {
    port_name: Option<String>,
    baud_rate: u32,
    port: Option<Box<dyn serialport::SerialPort>>,
    core: TransportCore,
}

impl SerialLink {
    pub fn new(port_name: Option<String>, baud_rate: u32) -> Self {
        Self {
            port_name,
            baud_rate,
            port: None,
            core: TransportCore::default(),
        }
    }

    /// Enumerate serial ports, flagging dashboard hardware.
    pub fn list_ports() -> Vec<PortInfo> {
        let ports = match serialport::available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                warn!("serial port enumeration failed: {}", e);
                return Vec::new();
            }
        };
        ports
            .into_iter()
            .map(|p| {
                let mut info = PortInfo {
                    port: p.port_name,
                    ..Default::default()
                };
                if let serialport::SerialPortType::UsbPort(usb) = p.port_type {
                    info.description = usb.product.unwrap_or_default();
                    info.manufacturer = usb.manufacturer.unwrap_or_default();
                    info.hardware_id = format!("USB VID:PID={:04X}:{:04X}", usb.vid, usb.pid);
                    info.is_dashboard = usb.vid == DASHBOARD_VID && usb.pid == DASHBOARD_PID;
                }
                info
            })
            .collect()
    }

    /// Port name of the first connected dashboard, if any.
    pub fn find_dashboard() -> Option<String> {
        Self::list_ports()
            .into_iter()
            .find(|p| p.is_dashboard)
            .map(|p| p.port)
    }

    fn resolve_port(&self) -> Option<String> {
        if let Some(name) = &self.port_name {
            return Some(name.clone());
        }
        let ports = Self::list_ports();
        if let Some(dash) = ports.iter().find(|p| p.is_dashboard) {
            info!("auto-detected dashboard on {}", dash.port);
            return Some(dash.port.clone());
        }
        if let Some(first) = ports.first() {
            info!("no dashboard found, using first available port {}", first.port);
            return Some(first.port.clone());
        }
        None
    }
}

impl Transport for SerialLink {
    fn connect(&mut self) -> bool {
        if self.core.state() == TransportState::Connected {
            warn!("already connected");
            return true;
        }
        self.core.set_state(TransportState::Connecting);

        let port_name = match self.resolve_port() {
            Some(name) => name,
            None => {
                self.core.report_error("no serial ports found");
                self.core.set_state(TransportState::Disconnected);
                return false;
            }
        };

        info!("connecting to {} at {} baud", port_name, self.baud_rate);
        let opened = serialport::new(&port_name, self.baud_rate)
            .timeout(Duration::from_millis(100))
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .open();
        match opened {
            Ok(port) => {
                self.port = Some(port);
                self.port_name = Some(port_name.clone());
                self.core.set_state(TransportState::Connected);
                info!("connected to {}", port_name);
                true
            }
            Err(e) => {
                self.core
                    .report_error(format!("failed to open {}: {}", port_name, e));
                self.core.set_state(TransportState::Error);
                false
            }
        }
    }

    fn disconnect(&mut self) {
        if self.core.state() == TransportState::Disconnected {
            return;
        }
        info!("closing serial port");
        // Dropping the handle closes the port.
        self.port = None;
        self.core.set_state(TransportState::Disconnected);
    }

    fn send(&mut self, data: &[u8]) -> bool {
        let port = match self.port.as_mut() {
            Some(port) => port,
            None => {
                warn!("send with no open port");
                return false;
            }
        };
        let result = match port.write_all(data) {
            Ok(()) => port.flush(),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                trace!("sent {} bytes", data.len());
                true
            }
            Err(e) => {
                self.core.report_error(format!("serial write failed: {}", e));
                self.core.set_state(TransportState::Error);
                false
            }
        }
    }

    fn receive(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        let port = self.port.as_mut()?;
        if port.timeout() != timeout {
            let _ = port.set_timeout(timeout);
        }
        let mut buf = [0u8; READ_CHUNK];
        match port.read(&mut buf) {
            Ok(0) => None,
            Ok(n) => {
                trace!("received {} bytes", n);
                Some(buf[..n].to_vec())
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => None,
            // EINTR shows up during shutdown signals; not a link failure.
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => None,
            Err(e) => {
                self.core.report_error(format!("serial read failed: {}", e));
                self.core.set_state(TransportState::Error);
                None
            }
        }
    }

    fn state(&self) -> TransportState {
        self.core.state()
    }

    fn set_event_sender(&mut self, sender: mpsc::UnboundedSender<TransportEvent>) {
        self.core.set_event_sender(sender);
    }
}
