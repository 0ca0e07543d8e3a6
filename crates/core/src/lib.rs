//! Core types for meshcall group-call sessions
//!
//! This crate holds everything the coordinator engine and a signaling
//! transport need to agree on: the participant model, the signaling
//! envelope, the control-channel gossip payloads, the persisted room
//! snapshot, and the [`SignalingTransport`] boundary trait. It knows
//! nothing about WebRTC; the engine lives in the `meshcall` crate.

pub mod control;
pub mod cowatch;
pub mod error;
pub mod participant;
pub mod signal;
pub mod state;
pub mod transport;

pub use control::{ControlMessage, ParticipantDelta, MAX_CONTROL_MESSAGE_SIZE};
pub use cowatch::CoWatchState;
pub use error::{Error, Result};
pub use participant::{now_millis, ConnectionState, Participant, Role};
pub use signal::{SignalBody, SignalKind, SignalMessage};
pub use state::RoomState;
pub use transport::SignalingTransport;
