//! Persisted per-session room snapshot
//!
//! Written with last-writer-wins semantics under a session-scoped key. This
//! is the fallback state source for joiners that have not yet opened a
//! control channel with every existing participant.

use crate::cowatch::CoWatchState;
use crate::participant::Participant;
use serde::{Deserialize, Serialize};

/// Full roster plus co-watch state, as persisted by the transport
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub cowatch: CoWatchState,
}

impl RoomState {
    pub fn new(participants: Vec<Participant>, cowatch: CoWatchState) -> Self {
        Self {
            participants,
            cowatch,
        }
    }

    /// Look up a participant by id
    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }
}
