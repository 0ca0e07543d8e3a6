//! Participant directory
//!
//! The in-memory map of participant state and the single source of truth
//! for rendering. Exactly one entry per user id; the local entry is seeded
//! at bootstrap and survives until disposal.

use meshcall_core::{Participant, ParticipantDelta};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Outcome of applying a gossip delta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryChange {
    Unchanged,
    Updated,
    Removed,
}

/// Map of user id → participant state
pub struct ParticipantDirectory {
    local_user: String,
    entries: RwLock<HashMap<String, Participant>>,
}

impl ParticipantDirectory {
    /// Create the directory seeded with the local participant
    pub fn new(local: Participant) -> Self {
        let local_user = local.user_id.clone();
        let mut entries = HashMap::new();
        entries.insert(local_user.clone(), local);
        Self {
            local_user,
            entries: RwLock::new(entries),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_user
    }

    pub async fn contains(&self, user_id: &str) -> bool {
        self.entries.read().await.contains_key(user_id)
    }

    pub async fn get(&self, user_id: &str) -> Option<Participant> {
        self.entries.read().await.get(user_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Insert or replace an entry wholesale
    pub async fn upsert(&self, participant: Participant) {
        self.entries
            .write()
            .await
            .insert(participant.user_id.clone(), participant);
    }

    /// Insert an entry only if the user is unknown; returns true if added
    pub async fn insert_if_absent(&self, participant: Participant) -> bool {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&participant.user_id) {
            return false;
        }
        entries.insert(participant.user_id.clone(), participant);
        true
    }

    /// Mutate an existing entry in place; returns false if unknown
    pub async fn update<F>(&self, user_id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut Participant),
    {
        let mut entries = self.entries.write().await;
        match entries.get_mut(user_id) {
            Some(p) => {
                mutate(p);
                p.touch();
                true
            }
            None => false,
        }
    }

    /// Apply a gossip delta by field presence.
    ///
    /// Unknown users are created first (a sync may precede the join for a
    /// peer we have not met); departure deltas remove the entry. The local
    /// entry can be updated but never removed.
    pub async fn merge_delta(&self, delta: &ParticipantDelta) -> DirectoryChange {
        let mut entries = self.entries.write().await;

        if delta.is_departure() {
            if delta.user_id == self.local_user {
                warn!("ignoring departure delta for the local participant");
                return DirectoryChange::Unchanged;
            }
            return match entries.remove(&delta.user_id) {
                Some(_) => DirectoryChange::Removed,
                None => DirectoryChange::Unchanged,
            };
        }

        match entries.get_mut(&delta.user_id) {
            Some(existing) => {
                if existing.merge_delta(delta) {
                    DirectoryChange::Updated
                } else {
                    DirectoryChange::Unchanged
                }
            }
            None => {
                debug!("directory learned of {} via gossip", delta.user_id);
                let name = delta
                    .display_name
                    .clone()
                    .unwrap_or_else(|| delta.user_id.clone());
                let mut created = Participant::new(delta.user_id.clone(), name);
                created.merge_delta(delta);
                entries.insert(delta.user_id.clone(), created);
                DirectoryChange::Updated
            }
        }
    }

    /// Remove an entry; the local participant is not removable
    pub async fn remove(&self, user_id: &str) -> Option<Participant> {
        if user_id == self.local_user {
            warn!("refusing to remove the local participant");
            return None;
        }
        self.entries.write().await.remove(user_id)
    }

    /// Full roster, sorted by user id for deterministic rendering
    pub async fn roster(&self) -> Vec<Participant> {
        let mut all: Vec<Participant> = self.entries.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        all
    }

    /// Full-snapshot deltas for catch-up gossip on channel open
    pub async fn snapshot_deltas(&self) -> Vec<ParticipantDelta> {
        self.roster().await.iter().map(ParticipantDelta::from).collect()
    }

    /// Drop every entry, the local one included; disposal only
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcall_core::Role;

    fn directory() -> ParticipantDirectory {
        ParticipantDirectory::new(Participant::new("me", "Me").with_role(Role::Host))
    }

    #[tokio::test]
    async fn local_entry_is_seeded_and_not_removable() {
        let dir = directory();
        assert!(dir.contains("me").await);
        assert!(dir.remove("me").await.is_none());
        assert!(dir.contains("me").await);

        let departure = ParticipantDelta::new("me").with_left();
        assert_eq!(dir.merge_delta(&departure).await, DirectoryChange::Unchanged);
        assert!(dir.contains("me").await);
    }

    #[tokio::test]
    async fn gossip_creates_unknown_users() {
        let dir = directory();
        let delta = ParticipantDelta::new("u2")
            .with_display_name("Bob")
            .with_muted(true);
        assert_eq!(dir.merge_delta(&delta).await, DirectoryChange::Updated);

        let bob = dir.get("u2").await.unwrap();
        assert_eq!(bob.display_name, "Bob");
        assert!(bob.is_muted);
    }

    #[tokio::test]
    async fn departure_delta_removes_the_entry() {
        let dir = directory();
        dir.upsert(Participant::new("u2", "Bob")).await;

        let departure = ParticipantDelta::new("u2").with_left();
        assert_eq!(dir.merge_delta(&departure).await, DirectoryChange::Removed);
        assert!(!dir.contains("u2").await);

        // removing again is a no-op
        assert_eq!(dir.merge_delta(&departure).await, DirectoryChange::Unchanged);
    }

    #[tokio::test]
    async fn roster_is_sorted_by_user_id() {
        let dir = directory();
        dir.upsert(Participant::new("zed", "Zed")).await;
        dir.upsert(Participant::new("amy", "Amy")).await;

        let ids: Vec<String> = dir.roster().await.into_iter().map(|p| p.user_id).collect();
        assert_eq!(ids, vec!["amy", "me", "zed"]);
    }

    #[tokio::test]
    async fn insert_if_absent_does_not_clobber() {
        let dir = directory();
        dir.upsert(Participant::new("u2", "Bob")).await;

        let mut stale = Participant::new("u2", "Old Bob");
        stale.is_muted = true;
        assert!(!dir.insert_if_absent(stale).await);
        assert_eq!(dir.get("u2").await.unwrap().display_name, "Bob");
    }
}
