//! SFU Media Plane
//!
//! Per-room Selective Forwarding Unit: one peer connection per member, a
//! table of forwarded tracks, RTP copy loops, and the renegotiation protocol
//! that keeps each receiver's session description in sync with the tracks it
//! must receive.

mod error;
mod peer;
mod room;

pub use error::SfuError;
pub use peer::{SdpKind, SfuPeer};
pub use room::{RenegotiationHandler, SfuRoom};
