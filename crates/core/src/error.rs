//! Error types shared across the meshcall crates

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised at the transport boundary
#[derive(Debug, Error)]
pub enum Error {
    /// Signaling transport failure (send, subscribe, state write)
    #[error("Transport error: {0}")]
    Transport(String),

    /// A message failed structural validation
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A user id is already attached to the session
    #[error("Duplicate user in session: {0}")]
    DuplicateUser(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
