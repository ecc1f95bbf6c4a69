//! Stateful protocol session: turns an arbitrary byte stream into frames and
//! high-level operations into encoded frames.
//!
//! A [`Session`] owns the receive accumulation buffer, the wrapping outgoing
//! sequence counter, and any in-flight chunked configuration reassembly. It
//! performs no I/O and is not synchronized; the connection manager serializes
//! access.

use bytes::{Buf, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::{debug, error, warn};
use std::io::{Read, Write};

use super::{decode_frame, encode_frame, DecodeResult, Frame, MessageType, CHUNK_SIZE};

/// Per-chunk header: chunk_index (u16), total_chunks (u16), compressed (u8).
const CHUNK_HEADER_LEN: usize = 5;

#[derive(Debug)]
struct Reassembly {
    total: usize,
    received: usize,
    compressed: bool,
    slots: Vec<Option<Vec<u8>>>,
}

/// Stateful wrapper around the frame codec for one logical connection.
#[derive(Debug)]
pub struct Session {
    sequence: u8,
    rx: BytesMut,
    reassembly: Option<Reassembly>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            sequence: 0,
            rx: BytesMut::with_capacity(4096),
            reassembly: None,
        }
    }

    /// Return the next outgoing sequence number, wrapping mod 256.
    pub fn next_sequence(&mut self) -> u8 {
        let seq = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        seq
    }

    /// Append received bytes and extract every complete frame now available.
    ///
    /// Trailing bytes that may still become a frame stay buffered for the
    /// next call, so the stream can be cut at any read boundary.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Frame> {
        self.rx.extend_from_slice(data);
        let mut frames = Vec::new();
        loop {
            match decode_frame(&self.rx) {
                DecodeResult::NeedMore { discard } => {
                    if discard > 0 {
                        self.rx.advance(discard);
                    }
                    break;
                }
                DecodeResult::Invalid { consumed } => {
                    self.rx.advance(consumed);
                }
                DecodeResult::Frame { frame, consumed } => {
                    self.rx.advance(consumed);
                    frames.push(frame);
                }
            }
        }
        frames
    }

    /// Bytes currently buffered but not yet decoded.
    pub fn pending_len(&self) -> usize {
        self.rx.len()
    }

    fn build(&mut self, message_type: MessageType, payload: Vec<u8>) -> Vec<u8> {
        let frame = Frame::new(message_type, self.next_sequence(), payload);
        encode_frame(&frame)
    }

    pub fn create_ping(&mut self) -> Vec<u8> {
        self.build(MessageType::Ping, Vec::new())
    }

    pub fn create_get_info(&mut self) -> Vec<u8> {
        self.build(MessageType::GetInfo, Vec::new())
    }

    pub fn create_get_config(&mut self) -> Vec<u8> {
        self.build(MessageType::GetConfig, Vec::new())
    }

    pub fn create_subscribe_telemetry(&mut self, rate_hz: u16) -> Vec<u8> {
        self.build(
            MessageType::SubscribeTelemetry,
            rate_hz.to_le_bytes().to_vec(),
        )
    }

    pub fn create_unsubscribe_telemetry(&mut self) -> Vec<u8> {
        self.build(MessageType::UnsubscribeTelemetry, Vec::new())
    }

    pub fn create_set_channel(&mut self, channel_id: u16, value: u32) -> Vec<u8> {
        let mut payload = Vec::with_capacity(6);
        payload.extend_from_slice(&channel_id.to_le_bytes());
        payload.extend_from_slice(&value.to_le_bytes());
        self.build(MessageType::SetChannel, payload)
    }

    pub fn create_restart(&mut self) -> Vec<u8> {
        self.build(MessageType::RestartDevice, Vec::new())
    }

    pub fn create_save_to_flash(&mut self) -> Vec<u8> {
        self.build(MessageType::SaveToFlash, Vec::new())
    }

    /// Build the chunked outbound transfer for a configuration payload.
    ///
    /// Payloads above one chunk are compressed when that actually shrinks
    /// them; the compressed flag is decided once for the whole transfer. Even
    /// an empty payload produces one (empty) chunk so the receiving side
    /// always sees a complete transfer. Frames are returned in chunk-index
    /// order; the caller sends them one by one, awaiting per-chunk acks.
    pub fn create_set_config(&mut self, config: &[u8]) -> Vec<Vec<u8>> {
        let (data, compressed) = if config.len() > CHUNK_SIZE {
            match compress(config) {
                Some(z) if z.len() < config.len() => (z, true),
                _ => (config.to_vec(), false),
            }
        } else {
            (config.to_vec(), false)
        };

        let total = ((data.len() + CHUNK_SIZE - 1) / CHUNK_SIZE).max(1);
        let mut frames = Vec::with_capacity(total);
        for idx in 0..total {
            let begin = idx * CHUNK_SIZE;
            let end = ((idx + 1) * CHUNK_SIZE).min(data.len());
            let chunk = &data[begin..end];

            let mut payload = Vec::with_capacity(CHUNK_HEADER_LEN + chunk.len());
            payload.extend_from_slice(&(idx as u16).to_le_bytes());
            payload.extend_from_slice(&(total as u16).to_le_bytes());
            payload.push(u8::from(compressed));
            payload.extend_from_slice(chunk);
            frames.push(self.build(MessageType::ConfigChunk, payload));
        }
        frames
    }

    /// Feed one inbound `CONFIG_CHUNK` payload into reassembly.
    ///
    /// Chunk 0 (re)initializes the reassembly state, including the transfer's
    /// compression flag. Chunks may arrive out of order, but nothing is
    /// accepted before chunk 0 establishes the session, and indices at or
    /// beyond the declared total are dropped. Returns the complete logical
    /// payload once every chunk is present, `None` otherwise.
    pub fn process_config_chunk(&mut self, payload: &[u8]) -> Option<Vec<u8>> {
        if payload.len() < CHUNK_HEADER_LEN {
            warn!("config chunk payload too short: {} bytes", payload.len());
            return None;
        }
        let chunk_idx = u16::from_le_bytes([payload[0], payload[1]]) as usize;
        let total = u16::from_le_bytes([payload[2], payload[3]]) as usize;
        let compressed = payload[4] != 0;
        let data = &payload[CHUNK_HEADER_LEN..];

        if chunk_idx == 0 {
            self.reassembly = Some(Reassembly {
                total,
                received: 0,
                compressed,
                slots: vec![None; total],
            });
        }

        let state = self.reassembly.as_mut()?;
        if chunk_idx < state.slots.len() {
            if state.slots[chunk_idx].is_none() {
                state.received += 1;
            }
            state.slots[chunk_idx] = Some(data.to_vec());
        } else {
            debug!(
                "ignoring out-of-range config chunk {} (total {})",
                chunk_idx, state.total
            );
        }

        if state.received < state.total {
            return None;
        }

        let state = self.reassembly.take()?;
        let mut complete = Vec::new();
        for slot in state.slots {
            complete.extend_from_slice(&slot.unwrap_or_default());
        }
        if state.compressed {
            match decompress(&complete) {
                Some(data) => Some(data),
                None => {
                    error!("failed to inflate reassembled configuration");
                    None
                }
            }
        } else {
            Some(complete)
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

fn compress(data: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(6));
    encoder.write_all(data).ok()?;
    encoder.finish().ok()
}

fn decompress(data: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data).read_to_end(&mut out).ok()?;
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{crc16, encode_frame, Frame, MessageType, FOOTER_BYTE, HEADER_BYTE};

    /// Deterministic pseudo-random bytes that deflate cannot shrink.
    fn noisy(len: usize) -> Vec<u8> {
        let mut state = 0x12345678u32;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 24) as u8
            })
            .collect()
    }

    fn chunk_payloads(frames: &[Vec<u8>]) -> Vec<Vec<u8>> {
        frames
            .iter()
            .map(|data| {
                let mut session = Session::new();
                let mut decoded = session.feed(data);
                assert_eq!(decoded.len(), 1);
                let frame = decoded.remove(0);
                assert_eq!(frame.message_type, MessageType::ConfigChunk);
                frame.payload
            })
            .collect()
    }

    #[test]
    fn sequence_wraps_mod_256() {
        let mut session = Session::new();
        for expected in 0..=255u8 {
            assert_eq!(session.next_sequence(), expected);
        }
        assert_eq!(session.next_sequence(), 0);
    }

    #[test]
    fn feed_yields_frame_after_leading_garbage() {
        let mut session = Session::new();
        let encoded = encode_frame(&Frame::empty(MessageType::Pong, 1));
        let mut data = vec![0x13, 0x37, 0xFF];
        data.extend_from_slice(&encoded);
        let frames = session.feed(&data);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message_type, MessageType::Pong);
        assert_eq!(session.pending_len(), 0);
    }

    #[test]
    fn feed_one_byte_at_a_time_yields_frame_exactly_once() {
        let mut session = Session::new();
        let frame = Frame::new(MessageType::LogMessage, 77, b"\x01hello".to_vec());
        let encoded = encode_frame(&frame);
        let mut seen = Vec::new();
        for (i, &byte) in encoded.iter().enumerate() {
            let frames = session.feed(&[byte]);
            if i + 1 < encoded.len() {
                assert!(frames.is_empty(), "frame yielded early at byte {}", i);
            }
            seen.extend(frames);
        }
        assert_eq!(seen, vec![frame]);
        // Nothing further comes out of an empty feed.
        assert!(session.feed(&[]).is_empty());
    }

    #[test]
    fn feed_two_back_to_back_frames_in_one_call() {
        let mut session = Session::new();
        let first = Frame::new(MessageType::TelemetryData, 10, vec![1, 2, 3]);
        let second = Frame::empty(MessageType::Ack, 11);
        let mut data = encode_frame(&first);
        data.extend_from_slice(&encode_frame(&second));
        let frames = session.feed(&data);
        assert_eq!(frames, vec![first, second]);
    }

    #[test]
    fn feed_recovers_after_corrupted_frame() {
        let mut session = Session::new();
        let good = Frame::new(MessageType::InfoResponse, 2, vec![9; 40]);
        let mut corrupted = encode_frame(&Frame::new(MessageType::Pong, 1, vec![4; 8]));
        // Overwrite the stored CRC with a wrong value that contains no header
        // byte, so resynchronization lands cleanly on the next real frame.
        let actual = crc16(&corrupted[1..13]).to_le_bytes();
        let stored = if actual == [0x11, 0x11] {
            [0x22, 0x22]
        } else {
            [0x11, 0x11]
        };
        corrupted[13] = stored[0];
        corrupted[14] = stored[1];
        let mut data = corrupted;
        data.extend_from_slice(&encode_frame(&good));
        // The corrupted frame resynchronizes byte by byte, then the good one
        // decodes from the same feed call.
        let frames = session.feed(&data);
        assert_eq!(frames, vec![good]);
    }

    #[test]
    fn feed_split_at_arbitrary_boundary_consumes_garbage_and_frame() {
        let frame = Frame::new(MessageType::ConfigData, 200, vec![0x5A; 300]);
        let encoded = encode_frame(&frame);
        let garbage = vec![0x00, 0x01, 0x02, 0x03, 0x04];
        let mut stream = garbage.clone();
        stream.extend_from_slice(&encoded);

        for split in 0..stream.len() {
            let mut session = Session::new();
            let mut frames = session.feed(&stream[..split]);
            frames.extend(session.feed(&stream[split..]));
            assert_eq!(frames, vec![frame.clone()], "split at {}", split);
            assert_eq!(session.pending_len(), 0, "split at {}", split);
        }
    }

    #[test]
    fn set_config_round_trips_for_boundary_sizes() {
        for size in [0usize, 1, 1023, 1024, 1025, 5000] {
            let config: Vec<u8> = (0..size).map(|i| (i * 7 % 256) as u8).collect();
            let mut sender = Session::new();
            let frames = sender.create_set_config(&config);
            assert!(!frames.is_empty(), "size {} produced no chunks", size);

            let mut receiver = Session::new();
            let mut result = None;
            for (i, payload) in chunk_payloads(&frames).iter().enumerate() {
                let complete = receiver.process_config_chunk(payload);
                if i + 1 < frames.len() {
                    assert!(complete.is_none(), "size {} completed early", size);
                } else {
                    result = complete;
                }
            }
            assert_eq!(result.as_deref(), Some(&config[..]), "size {}", size);
        }
    }

    #[test]
    fn large_repetitive_config_is_compressed() {
        let config = vec![b'x'; 5000];
        let mut sender = Session::new();
        let frames = sender.create_set_config(&config);
        // 5000 identical bytes deflate far below one chunk.
        assert_eq!(frames.len(), 1);
        let payloads = chunk_payloads(&frames);
        assert_eq!(payloads[0][4], 1, "compressed flag not set");

        let mut receiver = Session::new();
        assert_eq!(
            receiver.process_config_chunk(&payloads[0]).as_deref(),
            Some(&config[..])
        );
    }

    #[test]
    fn incompressible_config_stays_raw() {
        // A pseudo-random payload should not shrink under deflate.
        let config = noisy(2048);
        let mut sender = Session::new();
        let frames = sender.create_set_config(&config);
        let payloads = chunk_payloads(&frames);
        assert!(payloads.iter().all(|p| p[4] == 0));
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn reverse_order_chunks_never_complete_before_chunk_zero() {
        let config = noisy(2500);
        let mut sender = Session::new();
        let frames = sender.create_set_config(&config);
        let payloads = chunk_payloads(&frames);
        assert!(payloads.len() >= 2);

        // Without chunk 0 nothing is accepted, and chunk 0 itself starts a
        // fresh reassembly, so a pure reverse delivery never completes.
        let mut receiver = Session::new();
        for (i, payload) in payloads.iter().rev().enumerate() {
            assert!(
                receiver.process_config_chunk(payload).is_none(),
                "false completion at reverse step {}",
                i
            );
        }
        // The reassembly established by chunk 0 is still live: re-delivering
        // the remaining chunks in any order now finishes the transfer.
        let mut result = None;
        for payload in payloads.iter().skip(1) {
            result = receiver.process_config_chunk(payload);
        }
        assert_eq!(result.as_deref(), Some(&config[..]));
    }

    #[test]
    fn duplicate_chunk_does_not_fake_completion() {
        let config = noisy(2500);
        let mut sender = Session::new();
        let payloads = chunk_payloads(&sender.create_set_config(&config));
        assert_eq!(payloads.len(), 3);

        let mut receiver = Session::new();
        assert!(receiver.process_config_chunk(&payloads[0]).is_none());
        assert!(receiver.process_config_chunk(&payloads[1]).is_none());
        // Re-delivering chunk 1 must not count as the missing chunk 2.
        assert!(receiver.process_config_chunk(&payloads[1]).is_none());
        assert!(receiver.process_config_chunk(&payloads[2]).is_some());
    }

    #[test]
    fn stray_chunk_without_session_is_ignored() {
        let mut receiver = Session::new();
        // chunk_index 3 of total 5 with no chunk 0 seen yet
        let mut payload = Vec::new();
        payload.extend_from_slice(&3u16.to_le_bytes());
        payload.extend_from_slice(&5u16.to_le_bytes());
        payload.push(0);
        payload.extend_from_slice(&[0xAB; 16]);
        assert!(receiver.process_config_chunk(&payload).is_none());
    }

    #[test]
    fn create_helpers_use_fresh_sequences_and_documented_payloads() {
        let mut session = Session::new();
        let ping = session.create_ping();
        let subscribe = session.create_subscribe_telemetry(50);
        let set_channel = session.create_set_channel(7, 0xDEADBEEF);

        let mut decoder = Session::new();
        let mut frames = decoder.feed(&ping);
        frames.extend(decoder.feed(&subscribe));
        frames.extend(decoder.feed(&set_channel));
        assert_eq!(frames.len(), 3);

        assert_eq!(frames[0].message_type, MessageType::Ping);
        assert_eq!(frames[0].sequence, 0);
        assert!(frames[0].is_empty());

        assert_eq!(frames[1].message_type, MessageType::SubscribeTelemetry);
        assert_eq!(frames[1].sequence, 1);
        assert_eq!(frames[1].payload, 50u16.to_le_bytes());

        assert_eq!(frames[2].message_type, MessageType::SetChannel);
        assert_eq!(frames[2].sequence, 2);
        assert_eq!(frames[2].payload[..2], 7u16.to_le_bytes());
        assert_eq!(frames[2].payload[2..], 0xDEADBEEFu32.to_le_bytes());
    }

    #[test]
    fn unknown_frame_type_between_valid_frames_is_skipped() {
        let good = Frame::empty(MessageType::Ack, 1);
        let mut unknown = vec![HEADER_BYTE, 0x00, 0x6F, 0x00, 0x00];
        let crc = crc16(&unknown[1..]);
        unknown.extend_from_slice(&crc.to_le_bytes());
        unknown.push(FOOTER_BYTE);

        let mut stream = unknown;
        stream.extend_from_slice(&encode_frame(&good));
        let mut session = Session::new();
        assert_eq!(session.feed(&stream), vec![good]);
    }
}
