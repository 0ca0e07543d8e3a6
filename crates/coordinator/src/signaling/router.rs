//! Inbound signal classification, filtering and buffering
//!
//! The transport guarantees in-room delivery order but not that both ends
//! have created their peer links at the same time. The router repairs that
//! single gap: any non-`join` signal whose sender has no link yet is queued
//! per sender and replayed, in arrival order, as soon as the link exists.
//! `join` is never buffered; it is the trigger that may create a link.

use meshcall_core::{SignalBody, SignalKind, SignalMessage};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// A signal held back until its sender's peer link exists
#[derive(Debug, Clone)]
pub struct PendingSignal {
    pub body: SignalBody,
    /// Whether the original message was addressed specifically to us
    pub targeted: bool,
}

/// Per-session inbound signal router
pub struct SignalRouter {
    session_id: String,
    local_user: String,
    max_pending: usize,
    pending: RwLock<HashMap<String, VecDeque<PendingSignal>>>,
}

impl SignalRouter {
    pub fn new(
        session_id: impl Into<String>,
        local_user: impl Into<String>,
        max_pending: usize,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            local_user: local_user.into(),
            max_pending,
            pending: RwLock::new(HashMap::new()),
        }
    }

    /// Addressing filter: drop messages from self, messages addressed to
    /// someone else, and messages for a different session.
    pub fn accepts(&self, message: &SignalMessage) -> bool {
        if message.session_id != self.session_id {
            debug!(
                "dropping signal for foreign session {} (ours: {})",
                message.session_id, self.session_id
            );
            return false;
        }
        if message.sender == self.local_user {
            return false;
        }
        if !message.addressed_to(&self.local_user) {
            return false;
        }
        true
    }

    /// Queue a signal from `sender` until its link exists.
    ///
    /// `join` must never reach this; it is the caller's link-creation
    /// trigger.
    pub async fn buffer(&self, sender: &str, signal: PendingSignal) {
        debug_assert_ne!(signal.body.kind(), SignalKind::Join);
        let mut pending = self.pending.write().await;
        let queue = pending.entry(sender.to_string()).or_default();
        if queue.len() >= self.max_pending {
            warn!(
                "pending-signal queue for {} full ({}), dropping oldest",
                sender, self.max_pending
            );
            queue.pop_front();
        }
        debug!(
            "buffering {} from {} ({} queued)",
            signal.body.kind(),
            sender,
            queue.len() + 1
        );
        queue.push_back(signal);
    }

    /// Take every buffered signal for `sender`, in arrival order
    pub async fn drain(&self, sender: &str) -> Vec<PendingSignal> {
        let drained: Vec<PendingSignal> = self
            .pending
            .write()
            .await
            .remove(sender)
            .map(|q| q.into_iter().collect())
            .unwrap_or_default();
        if !drained.is_empty() {
            debug!("replaying {} buffered signal(s) from {}", drained.len(), sender);
        }
        drained
    }

    /// Number of signals currently buffered for `sender`
    pub async fn pending_count(&self, sender: &str) -> usize {
        self.pending
            .read()
            .await
            .get(sender)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Drop every buffered signal; used on disposal
    pub async fn clear(&self) {
        self.pending.write().await.clear();
    }
}
