//! Error types for the coordinator engine

use thiserror::Error;

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the coordinator engine
#[derive(Debug, Error)]
pub enum Error {
    /// Peer connection or negotiation failure
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Control data channel failure
    #[error("Data channel error: {0}")]
    DataChannelError(String),

    /// Local capture acquisition failure; fatal during bootstrap
    #[error("Media error: {0}")]
    MediaError(String),

    /// Signaling send/receive failure
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Operation on a participant the directory does not know
    #[error("Unknown participant: {0}")]
    UnknownParticipant(String),

    /// The session has been disposed
    #[error("Session disposed")]
    Disposed,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error from the core/transport layer
    #[error(transparent)]
    Core(#[from] meshcall_core::Error),
}

impl From<webrtc::Error> for Error {
    fn from(err: webrtc::Error) -> Self {
        Error::WebRtcError(err.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::WebRtcError(err.to_string())
    }
}
