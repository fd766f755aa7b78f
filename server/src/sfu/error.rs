//! SFU Errors

use thiserror::Error;

/// Errors raised by the media plane. These never cross a session boundary:
/// the signaling gateway logs them and drops the offending frame.
#[derive(Debug, Error)]
pub enum SfuError {
    /// A peer with this id is already registered in the room.
    #[error("peer already exists: {0}")]
    AlreadyExists(String),

    /// No peer with this id is registered in the room.
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// The stack rejected a session description.
    #[error("invalid session description: {0}")]
    BadSdp(String),

    /// The stack rejected an applied ICE candidate.
    #[error("invalid ICE candidate: {0}")]
    BadCandidate(String),

    /// The stack rejected a forwarded track.
    #[error("failed to attach track: {0}")]
    AddTrackFailed(String),

    /// A non-media message type reached the media plane.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// A signaling payload did not decode into the expected shape.
    #[error("malformed signal payload: {0}")]
    BadPayload(#[from] serde_json::Error),

    /// Any other WebRTC stack failure.
    #[error("webrtc error: {0}")]
    WebRtc(String),
}

impl From<webrtc::Error> for SfuError {
    fn from(err: webrtc::Error) -> Self {
        Self::WebRtc(err.to_string())
    }
}
