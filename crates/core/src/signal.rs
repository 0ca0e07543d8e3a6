//! Signaling envelope and message bodies
//!
//! Every signaling message is one [`SignalMessage`] sent as a room event:
//! session id, sender, optional target (absent = broadcast), a tagged body,
//! and a per-session nonce. The body tag is one of `join`, `leave`,
//! `offer`, `answer`, `ice-candidate`.

use serde::{Deserialize, Serialize};

/// Tagged signaling message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalBody {
    /// Announce presence in the session
    #[serde(rename_all = "camelCase")]
    Join {
        display_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        avatar_url: Option<String>,
    },
    /// Departure, voluntary or moderated (`reason = "kick"`)
    #[serde(rename_all = "camelCase")]
    Leave {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// SDP offer, always directed
    Offer { sdp: String },
    /// SDP answer, always directed
    Answer { sdp: String },
    /// Trickled ICE candidate
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        candidate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mline_index: Option<u16>,
    },
}

/// Leave reason used by moderation removal
pub const LEAVE_REASON_KICK: &str = "kick";

/// Signal classification, used by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Join,
    Leave,
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    /// Wire name of the kind
    pub fn name(&self) -> &'static str {
        match self {
            SignalKind::Join => "join",
            SignalKind::Leave => "leave",
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl SignalBody {
    /// Classify this body
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalBody::Join { .. } => SignalKind::Join,
            SignalBody::Leave { .. } => SignalKind::Leave,
            SignalBody::Offer { .. } => SignalKind::Offer,
            SignalBody::Answer { .. } => SignalKind::Answer,
            SignalBody::IceCandidate { .. } => SignalKind::IceCandidate,
        }
    }
}

/// A signaling room event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    pub session_id: String,
    pub sender: String,
    /// Absent target means broadcast to the whole room
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(flatten)]
    pub body: SignalBody,
    pub nonce: String,
}

impl SignalMessage {
    /// Build a broadcast message
    pub fn broadcast(
        session_id: impl Into<String>,
        sender: impl Into<String>,
        body: SignalBody,
        nonce: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            sender: sender.into(),
            target: None,
            body,
            nonce: nonce.into(),
        }
    }

    /// Build a message addressed to a single participant
    pub fn directed(
        session_id: impl Into<String>,
        sender: impl Into<String>,
        target: impl Into<String>,
        body: SignalBody,
        nonce: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            sender: sender.into(),
            target: Some(target.into()),
            body,
            nonce: nonce.into(),
        }
    }

    /// Whether this message has no specific target
    pub fn is_broadcast(&self) -> bool {
        self.target.is_none()
    }

    /// Whether `user_id` should observe this message
    pub fn addressed_to(&self, user_id: &str) -> bool {
        match &self.target {
            None => true,
            Some(t) => t == user_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_tag_uses_kebab_case() {
        let msg = SignalMessage::directed(
            "s1",
            "u1",
            "u2",
            SignalBody::IceCandidate {
                candidate: "candidate:1".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
            "n1",
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "ice-candidate");
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["target"], "u2");
    }

    #[test]
    fn broadcast_omits_target_and_reaches_everyone() {
        let msg = SignalMessage::broadcast(
            "s1",
            "u1",
            SignalBody::Join {
                display_name: "Alice".into(),
                avatar_url: None,
            },
            "n1",
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("target").is_none());
        assert!(msg.addressed_to("u2"));
        assert!(msg.addressed_to("u3"));
    }

    #[test]
    fn directed_message_addresses_only_its_target() {
        let msg = SignalMessage::directed(
            "s1",
            "u1",
            "u2",
            SignalBody::Offer { sdp: "v=0".into() },
            "n1",
        );
        assert!(msg.addressed_to("u2"));
        assert!(!msg.addressed_to("u3"));
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let msg = SignalMessage::broadcast(
            "s1",
            "u1",
            SignalBody::Leave {
                reason: Some(LEAVE_REASON_KICK.into()),
            },
            "n1",
        );
        let text = serde_json::to_string(&msg).unwrap();
        let back: SignalMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.body.kind(), SignalKind::Leave);
    }
}
