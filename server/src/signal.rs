//! Signaling Wire Model
//!
//! JSON envelope exchanged over the WebSocket: a tagged `type`, an opaque
//! payload, and correlation fields stamped by the server. One frame carries
//! exactly one message.

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// Message types carried by the signaling channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// SDP offer (client → SFU or SFU → client on renegotiation).
    Offer,
    /// SDP answer.
    Answer,
    /// Trickled ICE candidate.
    Candidate,
    /// Member joined the room.
    Join,
    /// Member left the room.
    Bye,
    /// Sent to a member right after it is admitted.
    Welcome,
    /// Chat text, relayed verbatim.
    Chat,
    /// Mute control, relayed verbatim.
    Mute,
    /// Unmute control, relayed verbatim.
    Unmute,
    /// Screen share control, relayed verbatim.
    ScreenShare,
}

impl SignalKind {
    /// True for the message types dispatched to the media plane instead of
    /// being re-broadcast to the room.
    #[must_use]
    pub const fn is_media_signal(self) -> bool {
        matches!(self, Self::Offer | Self::Answer | Self::Candidate)
    }
}

/// The signaling envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMessage {
    /// Message type tag.
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// Type-specific payload, passed through opaquely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Sender user id, stamped by the server on relayed frames.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from_user: String,
    /// Sender display name, stamped by the server on relayed frames.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from_name: String,
    /// Target user id, set by clients for directed messages.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to_user: String,
    /// Room id.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub room_id: String,
    /// Millisecond timestamp.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub time: i64,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(time: &i64) -> bool {
    *time == 0
}

impl SignalMessage {
    fn new(kind: SignalKind) -> Self {
        Self {
            kind,
            data: None,
            from_user: String::new(),
            from_name: String::new(),
            to_user: String::new(),
            room_id: String::new(),
            time: 0,
        }
    }

    /// Build an SDP offer message.
    #[must_use]
    pub fn offer(sdp: String) -> Self {
        Self {
            data: serde_json::to_value(SessionDescription {
                kind: "offer".into(),
                sdp,
            })
            .ok(),
            ..Self::new(SignalKind::Offer)
        }
    }

    /// Build an SDP answer message.
    #[must_use]
    pub fn answer(sdp: String) -> Self {
        Self {
            data: serde_json::to_value(SessionDescription {
                kind: "answer".into(),
                sdp,
            })
            .ok(),
            ..Self::new(SignalKind::Answer)
        }
    }

    /// Build a trickled ICE candidate message.
    #[must_use]
    pub fn candidate(candidate: IceCandidate) -> Self {
        Self {
            data: serde_json::to_value(candidate).ok(),
            ..Self::new(SignalKind::Candidate)
        }
    }

    /// Build the welcome message sent to a newly admitted member.
    #[must_use]
    pub fn welcome(user_id: &str) -> Self {
        Self {
            from_user: user_id.to_string(),
            time: now_millis(),
            ..Self::new(SignalKind::Welcome)
        }
    }

    /// Build the join notification broadcast to the rest of the room.
    #[must_use]
    pub fn join(user_id: &str, name: &str) -> Self {
        Self {
            from_user: user_id.to_string(),
            from_name: name.to_string(),
            time: now_millis(),
            ..Self::new(SignalKind::Join)
        }
    }

    /// Build the bye notification broadcast when a member disconnects.
    #[must_use]
    pub fn bye(user_id: &str, name: &str) -> Self {
        Self {
            from_user: user_id.to_string(),
            from_name: name.to_string(),
            time: now_millis(),
            ..Self::new(SignalKind::Bye)
        }
    }

    /// Decode the payload into a concrete shape.
    pub fn parse_data<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match &self.data {
            Some(value) => serde_json::from_value(value.clone()),
            None => serde_json::from_value(serde_json::Value::Null),
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// SDP payload for offer/answer messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    /// "offer" or "answer".
    #[serde(rename = "type")]
    pub kind: String,
    /// The session description.
    pub sdp: String,
}

/// ICE candidate payload. Field names follow the browser's
/// `RTCIceCandidateInit` dictionary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line.
    pub candidate: String,
    /// Media line index, absent for end-of-candidates style payloads.
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    /// Media stream identification tag.
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mline_index: init.sdp_mline_index,
            sdp_mid: init.sdp_mid,
        }
    }
}

/// Chat payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message text.
    pub content: String,
}

/// Mute/unmute/screen-share control payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    /// "audio", "video" or "screen".
    pub target: String,
    /// "on", "off" or "toggle".
    pub action: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_populated_fields() {
        let message = SignalMessage {
            kind: SignalKind::Chat,
            data: Some(serde_json::json!({"content": "hello"})),
            from_user: "u1".into(),
            from_name: "Alice".into(),
            to_user: "u2".into(),
            room_id: "r1".into(),
            time: 1_700_000_000_000,
        };

        let json = serde_json::to_string(&message).unwrap();
        let decoded: SignalMessage = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded.kind, SignalKind::Chat);
        assert_eq!(decoded.from_user, "u1");
        assert_eq!(decoded.from_name, "Alice");
        assert_eq!(decoded.to_user, "u2");
        assert_eq!(decoded.room_id, "r1");
        assert_eq!(decoded.time, 1_700_000_000_000);
        let chat: ChatMessage = decoded.parse_data().unwrap();
        assert_eq!(chat.content, "hello");
    }

    #[test]
    fn empty_correlation_fields_are_omitted() {
        let message = SignalMessage::offer("v=0".into());
        let json = serde_json::to_string(&message).unwrap();

        assert!(json.contains("\"type\":\"offer\""));
        assert!(!json.contains("from_user"));
        assert!(!json.contains("to_user"));
        assert!(!json.contains("room_id"));
        assert!(!json.contains("\"time\""));
    }

    #[test]
    fn screen_share_uses_snake_case_tag() {
        let json = r#"{"type":"screen_share","data":{"target":"screen","action":"on"}}"#;
        let decoded: SignalMessage = serde_json::from_str(json).unwrap();
        assert_eq!(decoded.kind, SignalKind::ScreenShare);
        let control: ControlMessage = decoded.parse_data().unwrap();
        assert_eq!(control.target, "screen");
        assert_eq!(control.action, "on");
    }

    #[test]
    fn unknown_type_is_rejected() {
        let json = r#"{"type":"definitely_not_a_signal"}"#;
        assert!(serde_json::from_str::<SignalMessage>(json).is_err());
    }

    #[test]
    fn candidate_without_mid_or_mline_index_is_accepted() {
        let json = r#"{"type":"candidate","data":{"candidate":"candidate:1 1 udp 1 127.0.0.1 5000 typ host"}}"#;
        let decoded: SignalMessage = serde_json::from_str(json).unwrap();
        let candidate: IceCandidate = decoded.parse_data().unwrap();

        assert!(candidate.sdp_mid.is_none());
        assert!(candidate.sdp_mline_index.is_none());

        let init = RTCIceCandidateInit::from(candidate);
        assert_eq!(init.candidate, "candidate:1 1 udp 1 127.0.0.1 5000 typ host");
        assert!(init.sdp_mid.is_none());
        assert!(init.sdp_mline_index.is_none());
    }

    #[test]
    fn candidate_payload_round_trips_through_init() {
        let original = IceCandidate {
            candidate: "candidate:2 1 udp 2 10.0.0.1 6000 typ host".into(),
            sdp_mline_index: Some(0),
            sdp_mid: Some("0".into()),
        };

        let init = RTCIceCandidateInit::from(original.clone());
        let back = IceCandidate::from(init);

        assert_eq!(back.candidate, original.candidate);
        assert_eq!(back.sdp_mline_index, original.sdp_mline_index);
        assert_eq!(back.sdp_mid, original.sdp_mid);

        let json = serde_json::to_string(&back).unwrap();
        assert!(json.contains("sdpMLineIndex"));
        assert!(json.contains("sdpMid"));
    }

    #[test]
    fn server_built_messages_carry_identity_and_time() {
        let welcome = SignalMessage::welcome("u1");
        assert_eq!(welcome.kind, SignalKind::Welcome);
        assert_eq!(welcome.from_user, "u1");
        assert!(welcome.time > 0);

        let join = SignalMessage::join("u2", "Bob");
        assert_eq!(join.kind, SignalKind::Join);
        assert_eq!(join.from_user, "u2");
        assert_eq!(join.from_name, "Bob");

        let bye = SignalMessage::bye("u2", "Bob");
        assert_eq!(bye.kind, SignalKind::Bye);
        assert_eq!(bye.from_user, "u2");
    }
}
