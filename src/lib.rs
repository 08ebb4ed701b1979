//! droidgate - Android device-streaming gateway
//!
//! This crate mirrors and remote-controls Android devices for automation.
//! It speaks the device agent's binary mirroring protocol over forwarded
//! TCP sockets, demultiplexes video/audio/control channels, re-publishes
//! video as a WebRTC media stream with dynamic H264 profile negotiation,
//! and exposes a shared binary control channel for injecting touch,
//! keyboard and clipboard events.

pub mod adb;
pub mod codec;
pub mod control;
pub mod error;
pub mod session;
pub mod webrtc;

pub use error::{GatewayError, Result};
