//! RoomLink: a real-time room client.
//!
//! Connects to a signaling server over a reconnecting websocket, drives a
//! pair of WebRTC peer connections (one publishing, one subscribing),
//! publishes and subscribes to media tracks, and exchanges application data
//! over data channels.
//!
//! The main entry point is [`RoomSession`]: build one, call
//! [`RoomSession::connect`] and it runs the whole connection lifecycle as a
//! single cancellable future. Everything else (participants, tracks, data
//! packets) is observed through the session's [`SignalHub`].

pub mod codec;
pub mod config;
pub mod error;
pub mod hub;
pub mod media;
pub mod peer;
pub mod room;
pub mod signaling;

pub use config::{RoomConfig, SignalingConfig};
pub use error::{Error, Result};
pub use hub::SignalHub;
pub use peer::{PeerRole, PeerSession, PeerSessionFactory};
pub use room::RoomSession;
pub use signaling::{ConnectionState, SignalingChannel};
