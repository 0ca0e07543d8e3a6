//! Call configuration

use std::time::Duration;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

/// Default debounce window for persisted-snapshot reconciliation
pub const DEFAULT_RECONCILE_DEBOUNCE: Duration = Duration::from_millis(350);

/// Default cap on buffered signals per remote sender
pub const DEFAULT_MAX_PENDING_SIGNALS: usize = 64;

/// Configuration for a group call session
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// STUN/TURN server URLs handed to every peer connection
    pub ice_servers: Vec<String>,
    /// Debounce window for persisted-snapshot writes; resets on each new
    /// local mutation rather than accumulating
    pub reconcile_debounce: Duration,
    /// Per-sender cap on signals buffered before their peer link exists
    pub max_pending_signals: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            reconcile_debounce: DEFAULT_RECONCILE_DEBOUNCE,
            max_pending_signals: DEFAULT_MAX_PENDING_SIGNALS,
        }
    }
}

impl CallConfig {
    /// Replace the ICE server list
    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    /// No ICE servers at all; host candidates only. Useful in-process and
    /// on trusted LANs.
    pub fn without_ice_servers(mut self) -> Self {
        self.ice_servers.clear();
        self
    }

    /// Override the reconciliation debounce window
    pub fn with_reconcile_debounce(mut self, debounce: Duration) -> Self {
        self.reconcile_debounce = debounce;
        self
    }

    /// Build the RTC configuration for a new peer connection
    pub fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}
