//! meshcall: client-side group-call coordinator
//!
//! Turns a generic, ordered, per-room signaling stream into a working
//! multi-party real-time call: a full mesh of WebRTC peer connections with
//! deterministic glare avoidance, out-of-order signal buffering, per-peer
//! control-channel gossip, and debounced reconciliation of a persisted room
//! snapshot. No central media server; every topology decision is made
//! client-side.
//!
//! # Overview
//!
//! - [`GroupCall`]: the facade UI code consumes, events plus imperative
//!   controls (mute, video, screenshare, co-watch, moderation, leave).
//! - [`signaling`]: inbound signal routing/buffering and two
//!   [`meshcall_core::SignalingTransport`] implementations.
//! - [`peer`]: one peer link per remote participant, negotiation included.
//! - [`channels`]: the per-link "control" data channel bus.
//! - [`session`]: the participant directory and snapshot reconciliation.
//! - [`media`]: the capture boundary and local/remote stream handles.
//!
//! # Example
//!
//! ```ignore
//! use meshcall::{GroupCall, GroupCallOptions, CallEventKind};
//! use meshcall::media::SampleMediaSource;
//! use meshcall::signaling::MemorySignalingHub;
//! use std::sync::Arc;
//!
//! let hub = MemorySignalingHub::new();
//! let call = GroupCall::create(
//!     GroupCallOptions::new("movie-night", "alice", "Alice"),
//!     Arc::new(hub.transport()),
//!     Arc::new(SampleMediaSource::new()),
//! )
//! .await?;
//!
//! let sub = call.on(CallEventKind::ParticipantsChanged, |event| {
//!     println!("roster: {event:?}");
//! });
//!
//! call.toggle_mute().await?;
//! call.leave().await?;
//! ```

pub mod channels;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;

pub use config::CallConfig;
pub use coordinator::{GroupCall, GroupCallOptions};
pub use error::{Error, Result};
pub use events::{CallEvent, CallEventKind, EventBus, Subscription};
pub use media::{LocalMedia, MediaSource, RemoteStreams, SampleMediaSource, ScreenShare};
pub use peer::{is_initiator, PeerLink, PeerLinkManager};
pub use signaling::{MemorySignalingHub, WebSocketSignaling};

// Re-export the shared data model so consumers need one import
pub use meshcall_core::{
    ConnectionState, ControlMessage, CoWatchState, Participant, ParticipantDelta, Role, RoomState,
    SignalBody, SignalKind, SignalMessage, SignalingTransport,
};
