//! Peer connection sessions, negotiation and the shared native factory.

pub mod events;
pub mod factory;
pub mod negotiation;
pub mod session;

pub use events::{DataChannelLabel, PeerEvent};
pub use factory::PeerSessionFactory;
pub use session::{PeerRole, PeerSession, Transmitter};
