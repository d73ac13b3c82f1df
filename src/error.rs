//! Error types for the roomlink crate.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by signaling, negotiation and publishing operations.
///
/// Most variants are fatal to the call that produced them, not to the
/// session: `NoPeerConnection` means an operation ran before `configure()`
/// or after teardown, `Timeout` and `NoDataChannel` are recoverable by the
/// caller, `MakeOffer` means the offering machine exhausted its state
/// stream without reaching a stable negotiated state and should trigger a
/// reconnect at a higher layer.
#[derive(Debug, Error)]
pub enum Error {
    /// Operation attempted before the peer connection was configured, or
    /// after it was torn down.
    #[error("no peer connection")]
    NoPeerConnection,

    /// The native factory refused to construct a peer connection.
    #[error("failed to create peer connection: {0}")]
    CreatePeerConnection(String),

    /// The peer connection refused to add a transceiver.
    #[error("failed to create transceiver: {0}")]
    CreateTransceiver(String),

    /// Neither the preferred nor the fallback data channel exists.
    #[error("no data channel")]
    NoDataChannel,

    /// The offering machine ended without reaching a stable negotiated
    /// state.
    #[error("offering machine did not reach a negotiated state")]
    MakeOffer,

    /// A bounded wait elapsed without the expected value arriving.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Websocket-level signaling failure.
    #[error("signaling error: {0}")]
    Signaling(String),

    /// The connect url could not be assembled.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Control-message (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error bubbled up from the webrtc engine.
    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
}
