//! In-process signaling hub
//!
//! A room-event transport living entirely in memory: ordered delivery,
//! broadcast vs. directed addressing, and last-writer-wins persisted state
//! per session. Backs the demo binary and the integration tests, which also
//! read its sent-message log.

use async_trait::async_trait;
use meshcall_core::{
    Error as CoreError, Result as CoreResult, RoomState, SignalKind, SignalMessage,
    SignalingTransport,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};

struct HubInner {
    /// session id → user id → delivery channel
    rooms: RwLock<HashMap<String, HashMap<String, mpsc::UnboundedSender<SignalMessage>>>>,
    /// session id → persisted snapshot
    states: RwLock<HashMap<String, RoomState>>,
    /// session id → number of snapshot writes
    state_writes: RwLock<HashMap<String, usize>>,
    /// every event ever sent, in room order
    log: RwLock<Vec<SignalMessage>>,
}

/// Shared in-memory room hub; cheap to clone
#[derive(Clone)]
pub struct MemorySignalingHub {
    inner: Arc<HubInner>,
}

impl Default for MemorySignalingHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySignalingHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                rooms: RwLock::new(HashMap::new()),
                states: RwLock::new(HashMap::new()),
                state_writes: RwLock::new(HashMap::new()),
                log: RwLock::new(Vec::new()),
            }),
        }
    }

    /// A transport handle onto this hub
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Every event sent so far, in order
    pub async fn sent(&self) -> Vec<SignalMessage> {
        self.inner.log.read().await.clone()
    }

    /// Sent events of one kind, in order
    pub async fn sent_of_kind(&self, kind: SignalKind) -> Vec<SignalMessage> {
        self.inner
            .log
            .read()
            .await
            .iter()
            .filter(|m| m.body.kind() == kind)
            .cloned()
            .collect()
    }

    /// Current persisted snapshot for a session
    pub async fn state(&self, session_id: &str) -> Option<RoomState> {
        self.inner.states.read().await.get(session_id).cloned()
    }

    /// How many snapshot writes a session has seen
    pub async fn state_write_count(&self, session_id: &str) -> usize {
        self.inner
            .state_writes
            .read()
            .await
            .get(session_id)
            .copied()
            .unwrap_or(0)
    }

    /// Connected user ids for a session
    pub async fn members(&self, session_id: &str) -> Vec<String> {
        self.inner
            .rooms
            .read()
            .await
            .get(session_id)
            .map(|room| room.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// A [`SignalingTransport`] handle onto a [`MemorySignalingHub`]
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<HubInner>,
}

#[async_trait]
impl SignalingTransport for MemoryTransport {
    async fn send_event(&self, message: SignalMessage) -> CoreResult<()> {
        // The write lock serializes sends, which is what gives the room its
        // total delivery order.
        let mut rooms = self.inner.rooms.write().await;
        self.inner.log.write().await.push(message.clone());

        let Some(room) = rooms.get_mut(&message.session_id) else {
            trace!("no subscribers in session {}", message.session_id);
            return Ok(());
        };

        let mut gone = Vec::new();
        for (user, tx) in room.iter() {
            if *user == message.sender || !message.addressed_to(user) {
                continue;
            }
            if tx.send(message.clone()).is_err() {
                gone.push(user.clone());
            }
        }
        for user in gone {
            debug!("dropping stale subscriber {} from {}", user, message.session_id);
            room.remove(&user);
        }
        Ok(())
    }

    async fn write_room_state(&self, session_id: &str, state: RoomState) -> CoreResult<()> {
        self.inner
            .states
            .write()
            .await
            .insert(session_id.to_string(), state);
        *self
            .inner
            .state_writes
            .write()
            .await
            .entry(session_id.to_string())
            .or_insert(0) += 1;
        Ok(())
    }

    async fn read_room_state(&self, session_id: &str) -> CoreResult<Option<RoomState>> {
        Ok(self.inner.states.read().await.get(session_id).cloned())
    }

    async fn subscribe(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> CoreResult<mpsc::UnboundedReceiver<SignalMessage>> {
        let mut rooms = self.inner.rooms.write().await;
        let room = rooms.entry(session_id.to_string()).or_default();
        if room.contains_key(user_id) {
            return Err(CoreError::DuplicateUser(user_id.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        room.insert(user_id.to_string(), tx);
        debug!("{} subscribed to session {}", user_id, session_id);
        Ok(rx)
    }
}
