//! Control-message envelopes exchanged over the signaling transport.
//!
//! The negotiation layer routes these as opaque tagged structures; the
//! concrete body schemas belong to the protocol owner. Frames on the wire
//! are the JSON encoding of [`SignalRequest`] / [`SignalResponse`].

use serde::{Deserialize, Serialize};

use crate::media::{
    ConnectionQualityInfo, ParticipantInfo, SpeakerInfo, TrackInfo, TrackKind, TrackSource,
    VideoLayer, VideoQuality,
};

/// Which peer connection a trickled candidate belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalTarget {
    Publisher,
    Subscriber,
}

/// A session description traveling in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// "offer" or "answer".
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: String) -> Self {
        Self {
            kind: "offer".to_string(),
            sdp,
        }
    }

    pub fn answer(sdp: String) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp,
        }
    }
}

/// An ICE candidate trickled outside the offer/answer exchange. The
/// candidate itself stays an opaque JSON string handed to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trickle {
    pub target: SignalTarget,
    pub candidate_init: String,
}

/// ICE server entry delivered in the join response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RoomInfo {
    #[serde(default)]
    pub sid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub num_participants: u32,
}

/// Snapshot delivered once per connection attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinResponse {
    #[serde(default)]
    pub room: RoomInfo,
    pub participant: ParticipantInfo,
    #[serde(default)]
    pub other_participants: Vec<ParticipantInfo>,
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    /// When set, the subscriber connection is primary and the publisher
    /// only negotiates on demand.
    #[serde(default)]
    pub subscriber_primary: bool,
    #[serde(default)]
    pub force_relay: bool,
    #[serde(default)]
    pub ping_interval_secs: u32,
    #[serde(default)]
    pub ping_timeout_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantUpdate {
    pub participants: Vec<ParticipantInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackPublished {
    /// Client-generated track id the acknowledgment is keyed on.
    pub cid: String,
    pub track: TrackInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackUnpublished {
    pub track_sid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Leave {
    #[serde(default)]
    pub can_reconnect: bool,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRefresh {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionQualityUpdate {
    pub updates: Vec<ConnectionQualityInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribedQuality {
    pub quality: VideoQuality,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribedQualityUpdate {
    pub track_sid: String,
    pub subscribed_qualities: Vec<SubscribedQuality>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamState {
    pub participant_sid: String,
    pub track_sid: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStateUpdate {
    pub stream_states: Vec<StreamState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionPermissionUpdate {
    pub participant_sid: String,
    pub track_sid: String,
    pub allowed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakersChanged {
    pub speakers: Vec<SpeakerInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomUpdate {
    pub room: RoomInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddTrackRequest {
    pub cid: String,
    pub name: String,
    pub kind: TrackKind,
    #[serde(default)]
    pub source: TrackSource,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub layers: Vec<VideoLayer>,
}

impl AddTrackRequest {
    pub fn from_publication(publication: &crate::media::Publication) -> Self {
        Self {
            cid: publication.cid.clone(),
            name: publication.name.clone(),
            kind: publication.kind,
            source: publication.source,
            width: publication.dimensions.width,
            height: publication.dimensions.height,
            muted: false,
            layers: publication.layers.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MuteTrackRequest {
    pub sid: String,
    pub muted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateTrackSettings {
    pub track_sids: Vec<String>,
    pub disabled: bool,
    pub width: u32,
    pub height: u32,
    pub quality: VideoQuality,
    pub fps: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackPermission {
    pub participant_sid: String,
    #[serde(default)]
    pub all_tracks: bool,
    #[serde(default)]
    pub track_sids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionPermission {
    pub all_participants: bool,
    #[serde(default)]
    pub track_permissions: Vec<TrackPermission>,
}

/// Outbound control messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalRequest {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Trickle(Trickle),
    AddTrack(AddTrackRequest),
    Mute(MuteTrackRequest),
    TrackSettings(UpdateTrackSettings),
    SubscriptionPermission(SubscriptionPermission),
    Leave(Leave),
    Ping(Ping),
}

/// Inbound control messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalResponse {
    Join(JoinResponse),
    Offer(SessionDescription),
    Answer(SessionDescription),
    Trickle(Trickle),
    Update(ParticipantUpdate),
    TrackPublished(TrackPublished),
    TrackUnpublished(TrackUnpublished),
    Leave(Leave),
    RefreshToken(TokenRefresh),
    ConnectionQuality(ConnectionQualityUpdate),
    SubscribedQualityUpdate(SubscribedQualityUpdate),
    Pong(Pong),
    StreamStateUpdate(StreamStateUpdate),
    SubscriptionPermissionUpdate(SubscriptionPermissionUpdate),
    SpeakersChanged(SpeakersChanged),
    RoomUpdate(RoomUpdate),
}

/// Delivery class of an application data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataPacketKind {
    Reliable,
    Lossy,
}

/// Application payload addressed to a set of participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPacket {
    #[serde(default)]
    pub participant_sid: String,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub destination_sids: Vec<String>,
}

/// Body of a data-channel packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataPayload {
    User(UserPacket),
    Speaker(SpeakersChanged),
}

/// Tagged packet traveling over the data channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPacket {
    pub kind: DataPacketKind,
    pub payload: DataPayload,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::ParticipantState;

    fn participant(sid: &str, state: ParticipantState) -> ParticipantInfo {
        ParticipantInfo {
            sid: sid.to_string(),
            identity: format!("id-{sid}"),
            name: String::new(),
            state,
            tracks: Vec::new(),
            metadata: String::new(),
        }
    }

    #[test]
    fn test_request_envelope_is_tagged() {
        let request = SignalRequest::Trickle(Trickle {
            target: SignalTarget::Publisher,
            candidate_init: "{}".to_string(),
        });
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "trickle");
        assert_eq!(json["target"], "publisher");
    }

    #[test]
    fn test_response_round_trip() {
        let response = SignalResponse::Join(JoinResponse {
            room: RoomInfo::default(),
            participant: participant("PA_local", ParticipantState::Joined),
            other_participants: vec![participant("PA_other", ParticipantState::Active)],
            ice_servers: Vec::new(),
            subscriber_primary: true,
            force_relay: false,
            ping_interval_secs: 30,
            ping_timeout_secs: 15,
        });
        let bytes = serde_json::to_vec(&response).unwrap();
        let decoded: SignalResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_unknown_message_type_is_an_error() {
        let result = serde_json::from_str::<SignalResponse>(r#"{"type":"no_such_message"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_data_packet_round_trip() {
        let packet = DataPacket {
            kind: DataPacketKind::Lossy,
            payload: DataPayload::User(UserPacket {
                participant_sid: "PA_x".to_string(),
                payload: vec![1, 2, 3],
                destination_sids: vec!["PA_y".to_string()],
            }),
        };
        let bytes = serde_json::to_vec(&packet).unwrap();
        let decoded: DataPacket = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }
}
