//! Typed event stream over the native peer-connection delegate callbacks.
//!
//! The webrtc engine reports everything through boxed callback handlers.
//! Each session wires those callbacks into a single tagged [`PeerEvent`]
//! stream so the rest of the system pattern-matches instead of touching
//! handler objects.

use std::sync::Arc;

use bytes::Bytes;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_remote::TrackRemote;

/// Well-known data channel labels.
pub const RELIABLE_LABEL: &str = "_reliable";
pub const LOSSY_LABEL: &str = "_lossy";

/// Logical data channel identity derived from its label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataChannelLabel {
    /// Ordered, unlimited retransmits.
    Reliable,
    /// Ordered, zero retransmits.
    Lossy,
    Other(String),
}

impl DataChannelLabel {
    pub fn as_str(&self) -> &str {
        match self {
            DataChannelLabel::Reliable => RELIABLE_LABEL,
            DataChannelLabel::Lossy => LOSSY_LABEL,
            DataChannelLabel::Other(label) => label,
        }
    }
}

impl From<&str> for DataChannelLabel {
    fn from(label: &str) -> Self {
        match label {
            RELIABLE_LABEL => DataChannelLabel::Reliable,
            LOSSY_LABEL => DataChannelLabel::Lossy,
            other => DataChannelLabel::Other(other.to_string()),
        }
    }
}

/// Events surfaced by one peer connection.
#[derive(Clone)]
pub enum PeerEvent {
    ConnectionState(RTCPeerConnectionState),
    SignalingState(RTCSignalingState),
    IceConnectionState(RTCIceConnectionState),
    IceGatheringState(RTCIceGathererState),
    /// A locally generated ICE candidate, serialized as candidate-init
    /// JSON ready for a trickle message. `None` marks end of gathering.
    CandidateGenerated(Option<String>),
    /// A remote track started arriving on the subscribing connection.
    TrackAdded {
        track: Arc<TrackRemote>,
        receiver: Arc<RTCRtpReceiver>,
    },
    /// The remote side opened a data channel toward us.
    DataChannelOpened {
        label: DataChannelLabel,
        channel: Arc<RTCDataChannel>,
    },
    DataChannelStateChanged {
        label: DataChannelLabel,
        state: RTCDataChannelState,
    },
    /// Bytes arrived on one of the data channels.
    DataChannelMessage {
        label: DataChannelLabel,
        data: Bytes,
    },
    NegotiationNeeded,
}

// the native track/receiver/channel handles carry no Debug of their own
impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::ConnectionState(state) => write!(f, "ConnectionState({state})"),
            PeerEvent::SignalingState(state) => write!(f, "SignalingState({state})"),
            PeerEvent::IceConnectionState(state) => write!(f, "IceConnectionState({state})"),
            PeerEvent::IceGatheringState(state) => write!(f, "IceGatheringState({state})"),
            PeerEvent::CandidateGenerated(Some(_)) => write!(f, "CandidateGenerated"),
            PeerEvent::CandidateGenerated(None) => write!(f, "CandidateGenerated(end)"),
            PeerEvent::TrackAdded { track, .. } => {
                write!(f, "TrackAdded({}/{})", track.stream_id(), track.id())
            }
            PeerEvent::DataChannelOpened { label, .. } => {
                write!(f, "DataChannelOpened({})", label.as_str())
            }
            PeerEvent::DataChannelStateChanged { label, state } => {
                write!(f, "DataChannelStateChanged({}, {state})", label.as_str())
            }
            PeerEvent::DataChannelMessage { label, data } => {
                write!(f, "DataChannelMessage({}, {} bytes)", label.as_str(), data.len())
            }
            PeerEvent::NegotiationNeeded => write!(f, "NegotiationNeeded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_round_trip() {
        assert_eq!(DataChannelLabel::from("_reliable"), DataChannelLabel::Reliable);
        assert_eq!(DataChannelLabel::from("_lossy"), DataChannelLabel::Lossy);
        assert_eq!(
            DataChannelLabel::from("chat"),
            DataChannelLabel::Other("chat".to_string())
        );
        assert_eq!(DataChannelLabel::Reliable.as_str(), "_reliable");
    }
}
