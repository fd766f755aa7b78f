//! Parley SFU Server
//!
//! A small WebRTC Selective Forwarding Unit with an integrated WebSocket
//! signaling plane. Each room member holds a single peer connection to the
//! server; inbound RTP is copied into per-receiver local tracks, so every
//! media track makes one hop in and one hop out per receiver.

pub mod api;
pub mod config;
pub mod room;
pub mod sfu;
pub mod signal;
