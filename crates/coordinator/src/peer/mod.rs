//! Peer link ownership and negotiation
//!
//! One [`PeerLink`] per remote participant that has begun negotiation,
//! owned exclusively by the coordinator. The [`PeerLinkManager`] holds the
//! `remoteId → {connection, dataChannel}` map and performs the
//! offer/answer/candidate dance; glare is avoided by the deterministic
//! initiator rule in [`is_initiator`].

pub mod link;
pub mod manager;

pub use link::PeerLink;
pub use manager::{is_initiator, PeerEvent, PeerLinkManager};
