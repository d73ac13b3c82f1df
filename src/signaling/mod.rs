//! Signaling transport and control-message envelopes.

pub mod channel;
pub mod messages;

pub use channel::{ConnectionState, SignalingChannel};
pub use messages::{SignalRequest, SignalResponse};
