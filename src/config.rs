//! Configuration for signaling and room sessions.

use std::time::Duration;

/// Websocket signaling transport configuration.
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Minimum delay between the current socket becoming absent and the
    /// next reconnection attempt. The first connection is not rate
    /// limited.
    pub reconnect_window: Duration,

    /// Inbound frame buffer capacity. When the buffer overflows the oldest
    /// frames are dropped first.
    pub inbound_buffer: usize,

    /// How long `send` waits for a usable socket before failing.
    pub send_timeout: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            reconnect_window: Duration::from_secs(30),
            inbound_buffer: 32,
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// ICE server entry used to override the server-provided list.
#[derive(Debug, Clone, Default)]
pub struct IceServerConfig {
    /// STUN/TURN urls.
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// Room session configuration.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub signaling: SignalingConfig,

    /// Static ICE server override. When empty, the servers delivered in
    /// the join response are used.
    pub ice_servers: Vec<IceServerConfig>,

    /// Bound on the add-track request/acknowledgment rendezvous.
    pub add_track_timeout: Duration,

    /// Bound on waiting for the publisher connection to reach connected.
    pub connected_timeout: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            ice_servers: Vec::new(),
            add_track_timeout: Duration::from_secs(15),
            connected_timeout: Duration::from_secs(10),
        }
    }
}
