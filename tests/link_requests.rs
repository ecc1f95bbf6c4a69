//! Request/response behavior of the connection manager over a scripted
//! transport.

mod common;

use common::{config_chunk, info_reply, ScriptedTransport};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashlink::link::{ConnectionKind, DeviceEvent, DeviceLink};
use dashlink::protocol::{Frame, MessageType};

#[tokio::test]
async fn get_configuration_reassembles_three_chunks() {
    // A known 2500-byte configuration split 1024/1024/452 across three
    // uncompressed chunks, delivered back-to-back on GET_CONFIG.
    let expected: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
    let payload = expected.clone();
    let transport = ScriptedTransport::new(move |frame| match frame.message_type {
        MessageType::GetInfo => vec![info_reply(frame.sequence)],
        MessageType::GetConfig => {
            let mut chunks = Vec::new();
            for (idx, slice) in payload.chunks(1024).enumerate() {
                chunks.push(config_chunk(idx as u16, 3, false, slice, frame.sequence));
            }
            chunks
        }
        _ => Vec::new(),
    });

    let mut link = DeviceLink::new();
    assert!(link.connect(Box::new(transport), ConnectionKind::Serial).await);
    let config = link.get_configuration().await.expect("configuration");
    assert_eq!(config, expected);
    link.disconnect().await;
}

#[tokio::test]
async fn ping_measures_round_trip_and_updates_stats() {
    let transport = ScriptedTransport::new(|frame| match frame.message_type {
        MessageType::GetInfo => vec![info_reply(frame.sequence)],
        MessageType::Ping => vec![Frame::empty(MessageType::Pong, frame.sequence)],
        _ => Vec::new(),
    });

    let mut link = DeviceLink::new();
    assert!(link.connect(Box::new(transport), ConnectionKind::Serial).await);
    let rtt = link.ping().await.expect("pong");
    assert!(rtt >= 0.0);
    let stats = link.stats();
    assert!(stats.last_ping_ms >= 0.0);
    assert!(stats.packets_sent >= 2, "get_info + ping were sent");
    assert!(stats.packets_received >= 2);
    link.disconnect().await;
}

#[tokio::test]
async fn silent_device_times_out_with_none() {
    let transport = ScriptedTransport::new(|frame| match frame.message_type {
        MessageType::GetInfo => vec![info_reply(frame.sequence)],
        // Never answer pings.
        _ => Vec::new(),
    });

    let mut link = DeviceLink::new();
    assert!(link.connect(Box::new(transport), ConnectionKind::Serial).await);
    assert_eq!(link.ping().await, None);
    link.disconnect().await;
}

#[tokio::test]
async fn set_configuration_requires_ack_for_every_chunk() {
    let acked = Arc::new(AtomicU32::new(0));
    let counter = acked.clone();
    let transport = ScriptedTransport::new(move |frame| match frame.message_type {
        MessageType::GetInfo => vec![info_reply(frame.sequence)],
        MessageType::ConfigChunk => {
            counter.fetch_add(1, Ordering::SeqCst);
            vec![Frame::empty(MessageType::ConfigChunkAck, frame.sequence)]
        }
        _ => Vec::new(),
    });

    let mut link = DeviceLink::new();
    assert!(link.connect(Box::new(transport), ConnectionKind::Serial).await);
    // Incompressible payload spanning multiple chunks.
    let mut state = 0xCAFEBABEu32;
    let config: Vec<u8> = (0..3000)
        .map(|_| {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            (state >> 24) as u8
        })
        .collect();
    assert!(link.set_configuration(&config).await);
    assert_eq!(acked.load(Ordering::SeqCst), 3);
    link.disconnect().await;
}

#[tokio::test]
async fn set_configuration_aborts_on_nack() {
    let seen = Arc::new(AtomicU32::new(0));
    let counter = seen.clone();
    let transport = ScriptedTransport::new(move |frame| match frame.message_type {
        MessageType::GetInfo => vec![info_reply(frame.sequence)],
        MessageType::ConfigChunk => {
            counter.fetch_add(1, Ordering::SeqCst);
            vec![Frame::empty(MessageType::Nack, frame.sequence)]
        }
        _ => Vec::new(),
    });

    let mut link = DeviceLink::new();
    assert!(link.connect(Box::new(transport), ConnectionKind::Serial).await);
    assert!(!link.set_configuration(&[0u8; 64]).await);
    // The transfer stops at the first rejected chunk.
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    link.disconnect().await;
}

#[tokio::test]
async fn streaming_frames_fan_out_to_subscribers() {
    let transport = ScriptedTransport::new(|frame| match frame.message_type {
        MessageType::GetInfo => {
            let mut log_payload = vec![2u8];
            log_payload.extend_from_slice(b"boot complete");
            let mut error_payload = vec![0x07u8];
            error_payload.extend_from_slice(b"sector locked");
            vec![
                info_reply(frame.sequence),
                Frame::new(MessageType::TelemetryData, 0, vec![0u8; 24]),
                Frame::new(MessageType::LogMessage, 0, log_payload),
                Frame::new(MessageType::Error, 0, error_payload),
            ]
        }
        _ => Vec::new(),
    });

    let mut link = DeviceLink::new();
    let mut events = link.subscribe();
    assert!(link.connect(Box::new(transport), ConnectionKind::Serial).await);

    let mut saw_telemetry = false;
    let mut saw_log = false;
    let mut saw_error = false;
    let collect = async {
        while !(saw_telemetry && saw_log && saw_error) {
            match events.recv().await {
                Some(DeviceEvent::Telemetry(_)) => saw_telemetry = true,
                Some(DeviceEvent::Log { level, message }) => {
                    assert_eq!(level, 2);
                    assert_eq!(message, "boot complete");
                    saw_log = true;
                }
                Some(DeviceEvent::DeviceError(message)) => {
                    assert!(message.contains("FlashError"), "got: {}", message);
                    assert!(message.contains("sector locked"), "got: {}", message);
                    saw_error = true;
                }
                Some(_) => {}
                None => break,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), collect)
        .await
        .expect("streamed events did not arrive");
    assert!(saw_telemetry && saw_log && saw_error);

    assert_eq!(link.stats().errors, 1);
    link.disconnect().await;
}

#[tokio::test]
async fn device_info_is_populated_then_cleared_on_disconnect() {
    let transport = ScriptedTransport::new(|frame| match frame.message_type {
        MessageType::GetInfo => vec![info_reply(frame.sequence)],
        MessageType::Ping => vec![Frame::empty(MessageType::Pong, frame.sequence)],
        _ => Vec::new(),
    });

    let mut link = DeviceLink::new();
    assert!(link.device_info().is_none());
    assert!(link.connect(Box::new(transport), ConnectionKind::Serial).await);
    assert_eq!(link.connection_kind(), Some(ConnectionKind::Serial));

    let info = link.device_info().expect("identity fetched on connect");
    assert_eq!(info.firmware_version, "9.9.9-test");
    assert_eq!(info.serial_number, "TEST-0001");

    let _ = link.ping().await;
    assert!(link.stats().packets_sent > 0);

    link.disconnect().await;
    assert!(link.device_info().is_none());
    assert_eq!(link.connection_kind(), None);
    assert_eq!(link.stats().packets_sent, 0, "stats reset on disconnect");
    assert!(!link.is_connected());
}

#[tokio::test]
async fn wrong_ack_type_is_a_failure() {
    let transport = ScriptedTransport::new(|frame| match frame.message_type {
        MessageType::GetInfo => vec![info_reply(frame.sequence)],
        // Answer channel writes with a generic ACK instead of CHANNEL_ACK.
        MessageType::SetChannel => vec![Frame::empty(MessageType::Ack, frame.sequence)],
        _ => Vec::new(),
    });

    let mut link = DeviceLink::new();
    assert!(link.connect(Box::new(transport), ConnectionKind::Serial).await);
    assert!(!link.set_channel(3, 1500).await);
    link.disconnect().await;
}
