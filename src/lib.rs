//! # Dashlink - Racing Dashboard Device Link
//!
//! Dashlink configures and streams telemetry from racing-dashboard embedded
//! devices over a serial (or emulated) byte link. It implements the device's
//! binary framing protocol, a resumable stream decoder, chunked configuration
//! transfer with optional compression, and a connection manager that
//! multiplexes synchronous command/response exchanges with the asynchronous
//! telemetry and log streams arriving on the same wire.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dashlink::link::DeviceLink;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut link = DeviceLink::new();
//!     if link.connect_emulator().await {
//!         if let Some(rtt) = link.ping().await {
//!             println!("device answered in {:.1} ms", rtt);
//!         }
//!         link.disconnect().await;
//!     }
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`protocol`] - Frame codec, CRC-16 integrity, and the stateful session
//!   (receive buffering, sequence numbers, chunked config transfer)
//! - [`transport`] - The byte-transport trait plus serial and emulator
//!   implementations
//! - [`link`] - Connection manager: receive loop, request/response pairing,
//!   event fan-out, statistics
//! - [`telemetry`] - Telemetry and device-info records with display helpers
//! - [`config`] - TOML configuration for the CLI
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   DeviceLink    │ ← request/response, event fan-out
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │    Session      │ ← framing, CRC, chunk reassembly
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │   Transport     │ ← serial port or emulator
//! └─────────────────┘
//! ```
//!
//! Frames decoded by the session are dispatched in wire-arrival order:
//! telemetry, device-log and device-error frames fan out to subscribers,
//! while any other frame answers the single in-flight command. The framing
//! layer absorbs corruption by resynchronizing on the next header byte, so a
//! noisy link degrades to dropped frames rather than errors.

pub mod config;
pub mod link;
pub mod protocol;
pub mod telemetry;
pub mod transport;
