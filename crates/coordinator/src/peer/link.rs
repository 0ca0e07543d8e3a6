//! A single negotiated media connection to one remote participant

use meshcall_core::ConnectionState;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, warn};
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;

/// One bidirectional media connection plus its control data channel.
///
/// Candidates that arrive before the remote description is set are queued
/// here and flushed by the manager right after it lands.
pub struct PeerLink {
    remote_user_id: String,
    pc: Arc<RTCPeerConnection>,
    control: RwLock<Option<Arc<RTCDataChannel>>>,
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    state: RwLock<ConnectionState>,
}

impl PeerLink {
    pub fn new(remote_user_id: impl Into<String>, pc: Arc<RTCPeerConnection>) -> Self {
        Self {
            remote_user_id: remote_user_id.into(),
            pc,
            control: RwLock::new(None),
            pending_candidates: Mutex::new(Vec::new()),
            state: RwLock::new(ConnectionState::Connecting),
        }
    }

    pub fn remote_user_id(&self) -> &str {
        &self.remote_user_id
    }

    pub fn pc(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    /// Record the control channel for this link, whichever side created it
    pub fn set_control(&self, channel: Arc<RTCDataChannel>) {
        let mut guard = self.control.write();
        if guard.is_some() {
            debug!(
                "replacing control channel for {}",
                self.remote_user_id
            );
        }
        *guard = Some(channel);
    }

    pub fn control(&self) -> Option<Arc<RTCDataChannel>> {
        self.control.read().clone()
    }

    /// Queue a candidate received before the remote description
    pub fn queue_candidate(&self, candidate: RTCIceCandidateInit) {
        self.pending_candidates.lock().push(candidate);
    }

    /// Take every queued candidate, in arrival order
    pub fn take_candidates(&self) -> Vec<RTCIceCandidateInit> {
        std::mem::take(&mut *self.pending_candidates.lock())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    /// Tear down channel and connection; `Closed` is terminal
    pub async fn close(&self) {
        self.set_state(ConnectionState::Closed);
        let channel = self.control.write().take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                warn!(
                    "error closing control channel for {}: {}",
                    self.remote_user_id, e
                );
            }
        }
        if let Err(e) = self.pc.close().await {
            warn!(
                "error closing peer connection for {}: {}",
                self.remote_user_id, e
            );
        }
        debug!("peer link to {} closed", self.remote_user_id);
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("remote_user_id", &self.remote_user_id)
            .field("state", &self.state())
            .field("has_control", &self.control.read().is_some())
            .finish()
    }
}
