//! Wire format spoken with the relay.
//!
//! One JSON object per text frame, discriminated by `type`. Session
//! descriptions and candidates are carried as opaque JSON values and are never
//! inspected here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::CallError;

/// Address of a participant on the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `user<N>` with `N` in `0..10000`.
    pub fn random() -> Self {
        use rand::Rng;
        let n: u32 = rand::thread_rng().gen_range(0..10_000);
        Self(format!("user{n}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Opaque session description blob (`{"type": "offer", "sdp": "..."}` in practice).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionDescription(pub Value);

/// Opaque network candidate blob (`{"candidate": "...", "sdpMid": ...}` in practice).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IceCandidate(pub Value);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    Join {
        from: ParticipantId,
    },
    Joined,
    Offer {
        from: ParticipantId,
        to: ParticipantId,
        sdp: SessionDescription,
    },
    Answer {
        from: ParticipantId,
        to: ParticipantId,
        sdp: SessionDescription,
    },
    Candidate {
        from: ParticipantId,
        to: ParticipantId,
        candidate: IceCandidate,
    },
    Error {
        message: String,
    },
}

impl SignalingMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Join { .. } => "join",
            SignalingMessage::Joined => "joined",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::Candidate { .. } => "candidate",
            SignalingMessage::Error { .. } => "error",
        }
    }

    pub fn sender(&self) -> Option<&ParticipantId> {
        match self {
            SignalingMessage::Join { from }
            | SignalingMessage::Offer { from, .. }
            | SignalingMessage::Answer { from, .. }
            | SignalingMessage::Candidate { from, .. } => Some(from),
            SignalingMessage::Joined | SignalingMessage::Error { .. } => None,
        }
    }

    pub fn recipient(&self) -> Option<&ParticipantId> {
        match self {
            SignalingMessage::Offer { to, .. }
            | SignalingMessage::Answer { to, .. }
            | SignalingMessage::Candidate { to, .. } => Some(to),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<String, CallError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, CallError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_and_joined_match_relay_format() {
        let join = SignalingMessage::Join { from: "A".into() };
        assert_eq!(
            serde_json::to_value(&join).unwrap(),
            json!({"type": "join", "from": "A"})
        );
        assert_eq!(
            SignalingMessage::decode(r#"{"type":"joined"}"#).unwrap(),
            SignalingMessage::Joined
        );
    }

    #[test]
    fn offer_carries_sdp_verbatim() {
        let sdp = json!({"type": "offer", "sdp": "v=0\r\n", "extra": [1, 2]});
        let text = json!({"type": "offer", "from": "A", "to": "B", "sdp": sdp}).to_string();
        let decoded = SignalingMessage::decode(&text).unwrap();
        match &decoded {
            SignalingMessage::Offer { from, to, sdp: got } => {
                assert_eq!(from.as_str(), "A");
                assert_eq!(to.as_str(), "B");
                assert_eq!(got.0, sdp);
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert_eq!(decoded.recipient().map(ParticipantId::as_str), Some("B"));
    }

    #[test]
    fn candidate_and_error_frames_decode() {
        let text = r#"{"type":"candidate","from":"B","to":"A","candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0"}}"#;
        let decoded = SignalingMessage::decode(text).unwrap();
        assert_eq!(decoded.kind(), "candidate");
        assert_eq!(decoded.sender().map(ParticipantId::as_str), Some("B"));

        let error = SignalingMessage::decode(r#"{"type":"error","message":"unknown peer"}"#).unwrap();
        assert_eq!(
            error,
            SignalingMessage::Error {
                message: "unknown peer".into()
            }
        );
    }

    #[test]
    fn unknown_type_is_a_codec_error() {
        let err = SignalingMessage::decode(r#"{"type":"bye"}"#).unwrap_err();
        assert!(matches!(err, CallError::Codec(_)));
    }

    #[test]
    fn random_ids_use_user_prefix() {
        let id = ParticipantId::random();
        let n: u32 = id.as_str().trim_start_matches("user").parse().unwrap();
        assert!(id.as_str().starts_with("user"));
        assert!(n < 10_000);
        assert!(ParticipantId::from("   ").is_blank());
    }
}
