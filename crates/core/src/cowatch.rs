//! Shared co-watch state
//!
//! A single value per session, replaced wholesale on every toggle
//! (last-writer-wins, both over control channels and in the persisted
//! snapshot).

use crate::participant::now_millis;
use serde::{Deserialize, Serialize};

/// Synchronized co-watching state for a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoWatchState {
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
}

impl CoWatchState {
    /// An active state started now by `user_id`
    pub fn started(url: Option<String>, user_id: impl Into<String>) -> Self {
        Self {
            active: true,
            url,
            started_by: Some(user_id.into()),
            started_at: Some(now_millis()),
        }
    }

    /// The inactive state
    pub fn stopped() -> Self {
        Self::default()
    }
}
