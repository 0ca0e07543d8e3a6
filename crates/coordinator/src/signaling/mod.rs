//! Signal routing and the shipped signaling transports
//!
//! The engine consumes signaling through
//! [`meshcall_core::SignalingTransport`]; this module provides the inbound
//! router (classification, addressing filters, pre-link buffering) and two
//! transport implementations:
//! - [`MemorySignalingHub`]: an in-process room, used by tests and demos
//! - [`WebSocketSignaling`]: a client for a JSON relay over WebSocket

pub mod memory;
pub mod router;
pub mod websocket;

pub use memory::{MemorySignalingHub, MemoryTransport};
pub use router::{PendingSignal, SignalRouter};
pub use websocket::WebSocketSignaling;
