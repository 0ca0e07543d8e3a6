//! Control-channel gossip
//!
//! One reliable, ordered data channel named `"control"` rides on every peer
//! link and carries lightweight application-state deltas, independent of
//! media negotiation. See [`ControlChannelBus`].

pub mod control_bus;

pub use control_bus::{BusEvent, ControlChannelBus, CONTROL_CHANNEL_LABEL};
