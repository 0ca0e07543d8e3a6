//! Signaling transport boundary
//!
//! The coordinator consumes signaling through this trait and nothing else:
//! addressed room events plus a persisted per-session snapshot. In-room
//! delivery order is guaranteed by implementations; cross-participant
//! synchronization is not, and is repaired by the coordinator's signal
//! buffering.

use crate::signal::SignalMessage;
use crate::state::RoomState;
use crate::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Room-event signaling with persisted session state
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Send an addressed room event. Broadcast when the message carries no
    /// target.
    async fn send_event(&self, message: SignalMessage) -> Result<()>;

    /// Overwrite the persisted snapshot for a session (last-writer-wins)
    async fn write_room_state(&self, session_id: &str, state: RoomState) -> Result<()>;

    /// Read the persisted snapshot for a session, if any
    async fn read_room_state(&self, session_id: &str) -> Result<Option<RoomState>>;

    /// Subscribe to the session's event stream as `user_id`.
    ///
    /// Events arrive in room order. Unsubscribing is dropping the receiver.
    async fn subscribe(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<SignalMessage>>;
}
