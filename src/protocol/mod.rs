//! Binary framing protocol for the dashboard link.
//!
//! Dashboard devices speak a fixed little-endian frame format over the serial
//! (or emulated) byte stream:
//!
//! ```text
//! +--------+--------+---------+--------+--------+---------+--------+--------+
//! | Header | SeqNum | MsgType | LenLo  | LenHi  | Payload | CRC16  | Footer |
//! | 0xAA   | 1 byte | 1 byte  | 1 byte | 1 byte | N bytes | 2 byte | 0x55   |
//! +--------+--------+---------+--------+--------+---------+--------+--------+
//! ```
//!
//! The CRC-16/CCITT-FALSE checksum covers everything after the header byte up
//! to and including the payload. [`encode_frame`] and [`decode_frame`] are
//! pure functions; the stateful side (receive buffering, sequence numbers,
//! chunked configuration transfer) lives in [`session::Session`].
//!
//! [`decode_frame`] never fails hard: garbage before a header byte is
//! discarded wholesale, a frame with a bad footer or checksum costs exactly
//! one byte of resynchronization, and an otherwise well-formed frame with an
//! unknown type is swallowed whole. This keeps the decoder usable on a noisy
//! byte stream that may be cut at arbitrary read boundaries.

use crc::{Crc, CRC_16_IBM_3740};
use log::warn;

pub mod session;

pub use session::Session;

/// Start-of-frame marker.
pub const HEADER_BYTE: u8 = 0xAA;
/// End-of-frame marker.
pub const FOOTER_BYTE: u8 = 0x55;
/// Upper bound on a single frame's payload.
pub const MAX_PAYLOAD_SIZE: usize = 4096;
/// Configuration transfers are split into chunks of this many bytes.
pub const CHUNK_SIZE: usize = 1024;
/// Smallest possible encoded frame: 5-byte header + CRC + footer.
pub const MIN_FRAME_SIZE: usize = 8;

/// CRC-16/CCITT-FALSE: poly 0x1021, init 0xFFFF, no reflection, no xorout.
/// Matches the firmware's bit-at-a-time implementation; check value for
/// "123456789" is 0x29B1.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Checksum as used on the wire (header-minus-start-byte plus payload).
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Protocol message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // System
    Ping = 0x01,
    Pong = 0x02,
    Ack = 0x03,
    Nack = 0x04,
    Error = 0x05,

    // Device info
    GetInfo = 0x10,
    InfoResponse = 0x11,

    // Configuration
    GetConfig = 0x20,
    ConfigData = 0x21,
    SetConfig = 0x22,
    ConfigAck = 0x23,
    ConfigChunk = 0x24,
    ConfigChunkAck = 0x25,
    ConfigComplete = 0x26,

    // Telemetry
    SubscribeTelemetry = 0x30,
    UnsubscribeTelemetry = 0x31,
    TelemetryData = 0x32,

    // Control
    SetChannel = 0x40,
    ChannelAck = 0x41,
    RestartDevice = 0x42,
    SaveToFlash = 0x43,

    // Logging
    LogMessage = 0x50,
    StartLogging = 0x51,
    StopLogging = 0x52,

    // OTA (wire compatibility only; firmware upload is not driven from here)
    OtaStart = 0x60,
    OtaData = 0x61,
    OtaVerify = 0x62,
    OtaCommit = 0x63,
    OtaStatus = 0x64,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        let t = match value {
            0x01 => Self::Ping,
            0x02 => Self::Pong,
            0x03 => Self::Ack,
            0x04 => Self::Nack,
            0x05 => Self::Error,
            0x10 => Self::GetInfo,
            0x11 => Self::InfoResponse,
            0x20 => Self::GetConfig,
            0x21 => Self::ConfigData,
            0x22 => Self::SetConfig,
            0x23 => Self::ConfigAck,
            0x24 => Self::ConfigChunk,
            0x25 => Self::ConfigChunkAck,
            0x26 => Self::ConfigComplete,
            0x30 => Self::SubscribeTelemetry,
            0x31 => Self::UnsubscribeTelemetry,
            0x32 => Self::TelemetryData,
            0x40 => Self::SetChannel,
            0x41 => Self::ChannelAck,
            0x42 => Self::RestartDevice,
            0x43 => Self::SaveToFlash,
            0x50 => Self::LogMessage,
            0x51 => Self::StartLogging,
            0x52 => Self::StopLogging,
            0x60 => Self::OtaStart,
            0x61 => Self::OtaData,
            0x62 => Self::OtaVerify,
            0x63 => Self::OtaCommit,
            0x64 => Self::OtaStatus,
            _ => return None,
        };
        Some(t)
    }
}

/// Error codes carried in `ERROR` frame payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    Ok = 0x00,
    UnknownMessage = 0x01,
    InvalidPayload = 0x02,
    CrcError = 0x03,
    Timeout = 0x04,
    Busy = 0x05,
    NotSupported = 0x06,
    FlashError = 0x07,
    ConfigInvalid = 0x08,
}

impl ErrorCode {
    /// Unknown wire values fold into [`ErrorCode::UnknownMessage`].
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::Ok,
            0x02 => Self::InvalidPayload,
            0x03 => Self::CrcError,
            0x04 => Self::Timeout,
            0x05 => Self::Busy,
            0x06 => Self::NotSupported,
            0x07 => Self::FlashError,
            0x08 => Self::ConfigInvalid,
            _ => Self::UnknownMessage,
        }
    }
}

/// Parse an `ERROR` frame payload into its code and message text.
pub fn parse_error(payload: &[u8]) -> (ErrorCode, String) {
    if payload.is_empty() {
        return (ErrorCode::UnknownMessage, "unknown error".to_string());
    }
    let code = ErrorCode::from_u8(payload[0]);
    let message = String::from_utf8_lossy(&payload[1..]).into_owned();
    (code, message)
}

/// A single protocol frame. Immutable once constructed; encoding is a pure
/// function of the three fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,
    pub sequence: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Payloads larger than [`MAX_PAYLOAD_SIZE`] cannot be represented on the
    /// wire; callers split oversized transfers into chunks first.
    pub fn new(message_type: MessageType, sequence: u8, payload: Vec<u8>) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD_SIZE);
        Self {
            message_type,
            sequence,
            payload,
        }
    }

    pub fn empty(message_type: MessageType, sequence: u8) -> Self {
        Self::new(message_type, sequence, Vec::new())
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Outcome of one [`decode_frame`] attempt against the start of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeResult {
    /// The buffer holds no complete frame yet. `discard` leading bytes are
    /// pre-header garbage and can be dropped; everything after may still
    /// become a frame once more bytes arrive.
    NeedMore { discard: usize },
    /// `consumed` bytes were scanned and contain nothing usable: either no
    /// header byte at all, a one-byte resynchronization step after a footer
    /// or CRC mismatch, or a whole well-formed frame of unknown type.
    Invalid { consumed: usize },
    /// A complete, validated frame. `consumed` covers the frame plus any
    /// garbage that preceded it.
    Frame { frame: Frame, consumed: usize },
}

/// Build the wire representation of a frame.
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.payload.len() + MIN_FRAME_SIZE);
    out.push(HEADER_BYTE);
    out.push(frame.sequence);
    out.push(frame.message_type as u8);
    out.extend_from_slice(&(frame.payload.len() as u16).to_le_bytes());
    out.extend_from_slice(&frame.payload);
    let crc = crc16(&out[1..]);
    out.extend_from_slice(&crc.to_le_bytes());
    out.push(FOOTER_BYTE);
    out
}

/// Try to decode one frame from the start of `data`.
///
/// The caller is expected to retry with the same (grown) buffer after a
/// [`DecodeResult::NeedMore`], and to trim `consumed` bytes and retry
/// immediately after [`DecodeResult::Invalid`] or [`DecodeResult::Frame`].
pub fn decode_frame(data: &[u8]) -> DecodeResult {
    if data.len() < MIN_FRAME_SIZE {
        return DecodeResult::NeedMore { discard: 0 };
    }

    let start = match data.iter().position(|&b| b == HEADER_BYTE) {
        Some(idx) => idx,
        // No header anywhere: the whole buffer is garbage.
        None => {
            return DecodeResult::Invalid {
                consumed: data.len(),
            }
        }
    };

    let body = &data[start..];
    if body.len() < MIN_FRAME_SIZE {
        return DecodeResult::NeedMore { discard: start };
    }

    let sequence = body[1];
    let raw_type = body[2];
    let payload_len = u16::from_le_bytes([body[3], body[4]]) as usize;
    let frame_len = 5 + payload_len + 3;
    if body.len() < frame_len {
        return DecodeResult::NeedMore { discard: start };
    }

    let footer = body[frame_len - 1];
    if footer != FOOTER_BYTE {
        warn!("invalid footer byte 0x{:02X}, resyncing", footer);
        return DecodeResult::Invalid { consumed: start + 1 };
    }

    let received_crc = u16::from_le_bytes([body[5 + payload_len], body[6 + payload_len]]);
    let calculated_crc = crc16(&body[1..5 + payload_len]);
    if received_crc != calculated_crc {
        warn!(
            "CRC mismatch: received {:04X}, calculated {:04X}",
            received_crc, calculated_crc
        );
        return DecodeResult::Invalid { consumed: start + 1 };
    }

    let message_type = match MessageType::from_u8(raw_type) {
        Some(t) => t,
        None => {
            warn!("unknown message type 0x{:02X}", raw_type);
            // Checksum was good, so the length field is trustworthy: skip the
            // whole frame instead of resyncing byte by byte.
            return DecodeResult::Invalid {
                consumed: start + frame_len,
            };
        }
    };

    DecodeResult::Frame {
        frame: Frame::new(message_type, sequence, body[5..5 + payload_len].to_vec()),
        consumed: start + frame_len,
    }
}
