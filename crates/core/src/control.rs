//! Control-channel gossip payloads
//!
//! Lightweight application-state messages exchanged over the per-peer
//! "control" data channel, independent of media negotiation. Wire format is
//! JSON, one object per message: `{type, payload}` with `type` one of
//! `participants-sync`, `cowatch-toggle`, `screenshare-toggle`.

use crate::cowatch::CoWatchState;
use crate::participant::{ConnectionState, Participant, Role};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Maximum size of a serialized control message in bytes
pub const MAX_CONTROL_MESSAGE_SIZE: usize = 64 * 1024;

/// Partial per-participant state delta, merged by field presence.
///
/// Absent fields leave the target untouched; `Some(false)` explicitly
/// clears a flag. `left` marks a departure and removes the entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantDelta {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_muted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_video_muted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_screensharing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_co_watching: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_state: Option<ConnectionState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<bool>,
}

impl ParticipantDelta {
    /// Empty delta for a user
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_muted(mut self, muted: bool) -> Self {
        self.is_muted = Some(muted);
        self
    }

    pub fn with_video_muted(mut self, muted: bool) -> Self {
        self.is_video_muted = Some(muted);
        self
    }

    pub fn with_screensharing(mut self, active: bool) -> Self {
        self.is_screensharing = Some(active);
        self
    }

    pub fn with_co_watching(mut self, active: bool) -> Self {
        self.is_co_watching = Some(active);
        self
    }

    pub fn with_left(mut self) -> Self {
        self.left = Some(true);
        self
    }

    /// Whether this delta marks a departure
    pub fn is_departure(&self) -> bool {
        self.left.unwrap_or(false)
    }
}

impl From<&Participant> for ParticipantDelta {
    /// Full snapshot of a participant, used for catch-up gossip on channel
    /// open.
    fn from(p: &Participant) -> Self {
        Self {
            user_id: p.user_id.clone(),
            display_name: Some(p.display_name.clone()),
            avatar_url: p.avatar_url.clone(),
            role: Some(p.role),
            is_muted: Some(p.is_muted),
            is_video_muted: Some(p.is_video_muted),
            is_screensharing: Some(p.is_screensharing),
            is_co_watching: Some(p.is_co_watching),
            connection_state: Some(p.connection_state),
            left: None,
        }
    }
}

/// One control-channel message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Per-field participant deltas, merged by presence
    ParticipantsSync { participants: Vec<ParticipantDelta> },
    /// Wholesale replacement of the shared co-watch state
    #[serde(rename = "cowatch-toggle")]
    CoWatchToggle(CoWatchState),
    /// The sender toggled screensharing
    #[serde(rename_all = "camelCase")]
    ScreenshareToggle { user_id: String, active: bool },
}

impl ControlMessage {
    /// A sync message carrying a single delta
    pub fn single_delta(delta: ParticipantDelta) -> Self {
        ControlMessage::ParticipantsSync {
            participants: vec![delta],
        }
    }

    /// Wire name of the message kind
    pub fn kind_name(&self) -> &'static str {
        match self {
            ControlMessage::ParticipantsSync { .. } => "participants-sync",
            ControlMessage::CoWatchToggle(_) => "cowatch-toggle",
            ControlMessage::ScreenshareToggle { .. } => "screenshare-toggle",
        }
    }

    /// Serialize for transmission, enforcing the size cap
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_CONTROL_MESSAGE_SIZE {
            return Err(Error::InvalidMessage(format!(
                "control message of {} bytes exceeds maximum {}",
                bytes.len(),
                MAX_CONTROL_MESSAGE_SIZE
            )));
        }
        Ok(bytes)
    }

    /// Parse an inbound frame
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_message_wire_shape() {
        let msg = ControlMessage::single_delta(ParticipantDelta::new("u1").with_muted(true));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "participants-sync");
        assert_eq!(json["payload"]["participants"][0]["userId"], "u1");
        assert_eq!(json["payload"]["participants"][0]["isMuted"], true);
        // absent fields are omitted entirely, not serialized as null
        assert!(json["payload"]["participants"][0]
            .get("isVideoMuted")
            .is_none());
    }

    #[test]
    fn cowatch_toggle_wire_shape() {
        let msg = ControlMessage::CoWatchToggle(CoWatchState::started(None, "u2"));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "cowatch-toggle");
        assert_eq!(json["payload"]["active"], true);
        assert_eq!(json["payload"]["startedBy"], "u2");
    }

    #[test]
    fn screenshare_toggle_wire_shape() {
        let msg = ControlMessage::ScreenshareToggle {
            user_id: "u1".into(),
            active: true,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "screenshare-toggle");
        assert_eq!(json["payload"]["userId"], "u1");
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(ControlMessage::from_bytes(b"not json").is_err());
        assert!(ControlMessage::from_bytes(br#"{"type":"unknown","payload":{}}"#).is_err());
    }

    #[test]
    fn full_snapshot_delta_sets_every_field() {
        let p = Participant::new("u1", "Alice").with_role(Role::Host);
        let delta = ParticipantDelta::from(&p);
        assert_eq!(delta.display_name.as_deref(), Some("Alice"));
        assert_eq!(delta.role, Some(Role::Host));
        assert_eq!(delta.is_muted, Some(false));
        assert!(!delta.is_departure());
    }
}
