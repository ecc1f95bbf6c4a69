//! Telemetry and device-identity data decoded from frame payloads.
//!
//! The wire carries a fixed 24-byte telemetry record; the richer
//! [`TelemetryFrame`] is a superset the connection layer may fill in
//! incrementally (GPS, pressures, lap context, named custom channels). Fields
//! absent from the wire record default to zero/empty rather than coming from
//! any dynamic lookup.

use bitflags::bitflags;
use serde::Serialize;
use std::collections::HashMap;

bitflags! {
    /// Device fault bitset as reported by the firmware.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct FaultFlags: u32 {
        const OVER_VOLTAGE = 1 << 0;
        const UNDER_VOLTAGE = 1 << 1;
        const OVER_TEMP = 1 << 2;
        const CAN1_ERROR = 1 << 3;
        const CAN2_ERROR = 1 << 4;
        const GPS_ERROR = 1 << 5;
        const SD_ERROR = 1 << 6;
        const DISPLAY_ERROR = 1 << 7;
        const WIFI_ERROR = 1 << 8;
        const FLASH_ERROR = 1 << 9;
    }
}

impl FaultFlags {
    /// Names of all currently active faults.
    pub fn active_names(self) -> Vec<&'static str> {
        self.iter_names().map(|(name, _)| name).collect()
    }
}

impl Serialize for FaultFlags {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u32(self.bits())
    }
}

/// Real-time vehicle state.
///
/// [`TelemetryFrame::parse`] fills in the wire-record fields; everything else
/// stays at its default until some other source provides it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetryFrame {
    // Timestamp
    pub timestamp_ms: u32,

    // Engine
    pub rpm: u16,
    pub throttle_percent: u8,
    pub brake_percent: u8,
    pub gear: u8,

    // Vehicle
    pub speed_kmh: u16,
    pub g_lateral: f32,
    pub g_longitudinal: f32,

    // Temperatures
    pub coolant_temp_c: i8,
    pub oil_temp_c: i8,
    pub intake_temp_c: i8,
    pub exhaust_temp_c: i16,

    // Pressures
    pub oil_pressure_psi: f32,
    pub fuel_pressure_psi: f32,
    pub boost_pressure_psi: f32,

    // Fuel
    pub fuel_level_percent: u8,
    pub fuel_flow_lph: f32,

    // Electrical
    pub battery_voltage: f32,

    // GPS (not part of the minimal wire record)
    pub gps_lat: f64,
    pub gps_lon: f64,
    pub gps_speed_kmh: f32,
    pub gps_heading: f32,
    pub gps_altitude_m: f32,
    pub gps_satellites: u8,

    // Lap timing
    pub lap_number: u16,
    pub lap_time_ms: u32,
    pub best_lap_time_ms: u32,
    pub delta_ms: i32,
    pub sector: u8,

    // System
    pub fault_flags: FaultFlags,
    pub cpu_load_percent: u8,

    // Custom channels (CAN signals and the like)
    pub custom_channels: HashMap<String, f32>,
}

impl TelemetryFrame {
    /// Length of the fixed wire record. Bytes 18..20 are reserved.
    pub const WIRE_LEN: usize = 24;

    /// Decode the fixed wire record.
    ///
    /// A payload shorter than [`Self::WIRE_LEN`] yields the default frame so
    /// a malformed device burst never takes down the receive path.
    pub fn parse(payload: &[u8]) -> Self {
        if payload.len() < Self::WIRE_LEN {
            return Self::default();
        }
        Self {
            timestamp_ms: u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]),
            rpm: u16::from_le_bytes([payload[4], payload[5]]),
            speed_kmh: u16::from_le_bytes([payload[6], payload[7]]),
            gear: payload[8],
            throttle_percent: payload[9],
            brake_percent: payload[10],
            coolant_temp_c: payload[11] as i8,
            oil_temp_c: payload[12] as i8,
            fuel_level_percent: payload[13],
            g_lateral: i16::from_le_bytes([payload[14], payload[15]]) as f32 / 100.0,
            g_longitudinal: i16::from_le_bytes([payload[16], payload[17]]) as f32 / 100.0,
            lap_time_ms: u32::from_le_bytes([payload[20], payload[21], payload[22], payload[23]]),
            ..Self::default()
        }
    }

    /// Encode the fixed wire record (used by the emulated device).
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_LEN);
        out.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        out.extend_from_slice(&self.rpm.to_le_bytes());
        out.extend_from_slice(&self.speed_kmh.to_le_bytes());
        out.push(self.gear);
        out.push(self.throttle_percent);
        out.push(self.brake_percent);
        out.push(self.coolant_temp_c as u8);
        out.push(self.oil_temp_c as u8);
        out.push(self.fuel_level_percent);
        out.extend_from_slice(&((self.g_lateral * 100.0) as i16).to_le_bytes());
        out.extend_from_slice(&((self.g_longitudinal * 100.0) as i16).to_le_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.lap_time_ms.to_le_bytes());
        out
    }

    pub fn has_faults(&self) -> bool {
        !self.fault_flags.is_empty()
    }

    /// Names of the currently active fault flags.
    pub fn fault_names(&self) -> Vec<&'static str> {
        self.fault_flags.active_names()
    }
}

/// Format a lap time as `MM:SS.mmm`; zero means "no lap yet".
pub fn format_lap_time(time_ms: u32) -> String {
    if time_ms == 0 {
        return "--:--.---".to_string();
    }
    let minutes = time_ms / 60_000;
    let seconds = (time_ms % 60_000) / 1000;
    let millis = time_ms % 1000;
    format!("{:02}:{:02}.{:03}", minutes, seconds, millis)
}

/// Format a lap delta with an explicit sign, e.g. `-0.312`.
pub fn format_delta(delta_ms: i32) -> String {
    if delta_ms == 0 {
        return "+0.000".to_string();
    }
    let sign = if delta_ms > 0 { '+' } else { '-' };
    let abs = delta_ms.unsigned_abs();
    format!("{}{}.{:03}", sign, abs / 1000, abs % 1000)
}

/// Device identity parsed from an `INFO_RESPONSE` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub firmware_version: String,
    pub serial_number: String,
    pub hardware_version: String,
}

impl DeviceInfo {
    /// firmware_version(16) + serial_number(16) + hardware_version(8).
    pub const WIRE_LEN: usize = 40;

    /// Decode the fixed info payload; anything shorter is malformed.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < Self::WIRE_LEN {
            return None;
        }
        Some(Self {
            firmware_version: trim_field(&payload[..16]),
            serial_number: trim_field(&payload[16..32]),
            hardware_version: trim_field(&payload[32..40]),
        })
    }

    /// Encode the fixed info payload (used by the emulated device).
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_LEN);
        out.extend_from_slice(&pad_field::<16>(&self.firmware_version));
        out.extend_from_slice(&pad_field::<16>(&self.serial_number));
        out.extend_from_slice(&pad_field::<8>(&self.hardware_version));
        out
    }
}

/// Right-trim NUL padding and decode the rest tolerantly.
fn trim_field(raw: &[u8]) -> String {
    let end = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn pad_field<const N: usize>(value: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let bytes = value.as_bytes();
    let len = bytes.len().min(N);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}
