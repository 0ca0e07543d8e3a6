//! Participant model
//!
//! One [`Participant`] entry per user id in a session. The directory in the
//! coordinator crate is the single source of truth for rendering; these are
//! the plain-data fields that travel over control channels and into the
//! persisted room snapshot.

use crate::control::ParticipantDelta;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Participant role within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// Session creator, full moderation rights
    Host,
    /// Promoted participant with moderation rights
    Moderator,
    /// May screenshare and drive co-watching
    Presenter,
    /// Regular attendee
    #[default]
    Participant,
}

impl Role {
    /// Whether this role may mute others, promote, or kick
    pub fn can_moderate(&self) -> bool {
        matches!(self, Role::Host | Role::Moderator)
    }
}

/// Connection state of the media link backing a participant entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    /// No negotiation has started yet
    #[default]
    New,
    /// Negotiation in progress
    Connecting,
    /// Media flowing
    Connected,
    /// Transport interrupted, may recover
    Disconnected,
    /// ICE failed; a restart is attempted rather than teardown
    Failed,
    /// Link torn down on leave/kick/disposal; terminal
    Closed,
}

impl ConnectionState {
    /// States in which stream references must be dropped
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

/// A single participant in a group call
///
/// Exactly one entry exists per user id; the local user's entry is present
/// from session bootstrap until disposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub is_muted: bool,
    #[serde(default)]
    pub is_video_muted: bool,
    #[serde(default)]
    pub is_screensharing: bool,
    #[serde(default)]
    pub is_co_watching: bool,
    #[serde(default)]
    pub connection_state: ConnectionState,
    /// Millisecond wall-clock timestamp of the last observed activity
    #[serde(default)]
    pub last_active: u64,
}

impl Participant {
    /// Create a participant entry with default flags
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            avatar_url: None,
            role: Role::Participant,
            is_muted: false,
            is_video_muted: false,
            is_screensharing: false,
            is_co_watching: false,
            connection_state: ConnectionState::New,
            last_active: now_millis(),
        }
    }

    /// Set the role
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Set the avatar URL
    pub fn with_avatar(mut self, url: impl Into<String>) -> Self {
        self.avatar_url = Some(url.into());
        self
    }

    /// Refresh the activity timestamp
    pub fn touch(&mut self) {
        self.last_active = now_millis();
    }

    /// Merge a partial delta into this entry, by field presence.
    ///
    /// An absent field leaves the target untouched; `Some(false)` clears a
    /// flag. Returns true if anything changed.
    pub fn merge_delta(&mut self, delta: &ParticipantDelta) -> bool {
        let mut changed = false;
        macro_rules! apply {
            ($field:ident) => {
                if let Some(value) = &delta.$field {
                    if &self.$field != value {
                        self.$field = value.clone();
                        changed = true;
                    }
                }
            };
        }
        apply!(display_name);
        apply!(role);
        apply!(is_muted);
        apply!(is_video_muted);
        apply!(is_screensharing);
        apply!(is_co_watching);
        apply!(connection_state);
        if delta.avatar_url.is_some() && self.avatar_url != delta.avatar_url {
            self.avatar_url = delta.avatar_url.clone();
            changed = true;
        }
        if changed {
            self.touch();
        }
        changed
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_absent_fields_leave_entry_untouched() {
        let mut p = Participant::new("u1", "Alice");
        p.is_muted = true;

        let delta = ParticipantDelta::new("u1").with_video_muted(true);
        assert!(p.merge_delta(&delta));

        // is_muted was absent from the delta and must survive
        assert!(p.is_muted);
        assert!(p.is_video_muted);
    }

    #[test]
    fn merge_explicit_false_clears_flag() {
        let mut p = Participant::new("u1", "Alice");
        p.is_muted = true;

        let delta = ParticipantDelta::new("u1").with_muted(false);
        assert!(p.merge_delta(&delta));
        assert!(!p.is_muted);
    }

    #[test]
    fn merge_reports_no_change_for_identical_values() {
        let mut p = Participant::new("u1", "Alice");
        let delta = ParticipantDelta::new("u1").with_muted(false);
        assert!(!p.merge_delta(&delta));
    }

    #[test]
    fn role_moderation_rights() {
        assert!(Role::Host.can_moderate());
        assert!(Role::Moderator.can_moderate());
        assert!(!Role::Presenter.can_moderate());
        assert!(!Role::Participant.can_moderate());
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let p = Participant::new("u1", "Alice");
        let json = serde_json::to_value(&p).unwrap();
        assert!(json.get("userId").is_some());
        assert!(json.get("isMuted").is_some());
        assert!(json.get("connectionState").is_some());
    }
}
