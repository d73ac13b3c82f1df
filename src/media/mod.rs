//! Room media model: participants, tracks, publications and quality.

pub mod audio;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of a published track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
    Data,
}

/// Origin of a published track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrackSource {
    #[default]
    Unknown,
    Camera,
    Microphone,
    ScreenShare,
}

/// Server-side record of a published track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    /// Server-assigned track id.
    pub sid: String,
    pub name: String,
    pub kind: TrackKind,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub source: TrackSource,
}

/// Participant lifecycle state. Transitions only move forward; a
/// participant reaching any non-active terminal state is removed from the
/// room state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantState {
    Joining,
    Joined,
    Active,
    Disconnected,
}

/// A room participant and the tracks it publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub sid: String,
    pub identity: String,
    #[serde(default)]
    pub name: String,
    pub state: ParticipantState,
    #[serde(default)]
    pub tracks: Vec<TrackInfo>,
    #[serde(default)]
    pub metadata: String,
}

/// Coarse connection quality bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    Poor,
    Good,
    Excellent,
}

/// Per-participant quality snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionQualityInfo {
    pub participant_sid: String,
    pub quality: ConnectionQuality,
    #[serde(default)]
    pub score: f32,
}

/// Speaker activity entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerInfo {
    pub sid: String,
    #[serde(default)]
    pub level: f32,
    #[serde(default)]
    pub active: bool,
}

/// Video quality tier used for track settings and simulcast layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VideoQuality {
    Low,
    #[default]
    Medium,
    High,
}

impl VideoQuality {
    /// Recommended bitrate in kbps for this tier.
    pub fn recommended_bitrate_kbps(&self) -> u32 {
        match self {
            VideoQuality::High => 4000,
            VideoQuality::Medium => 1500,
            VideoQuality::Low => 500,
        }
    }

    /// Recommended resolution for this tier.
    pub fn recommended_resolution(&self) -> VideoDimensions {
        match self {
            VideoQuality::High => VideoDimensions::new(1920, 1080),
            VideoQuality::Medium => VideoDimensions::new(1280, 720),
            VideoQuality::Low => VideoDimensions::new(854, 480),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoDimensions {
    pub width: u32,
    pub height: u32,
}

impl VideoDimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// One simulcast layer advertised in an add-track request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoLayer {
    pub quality: VideoQuality,
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
}

impl VideoLayer {
    pub fn for_quality(quality: VideoQuality) -> Self {
        let dims = quality.recommended_resolution();
        Self {
            quality,
            width: dims.width,
            height: dims.height,
            bitrate_kbps: quality.recommended_bitrate_kbps(),
        }
    }
}

/// Short-lived descriptor for a track about to be published. Created per
/// publish call, discarded once the add-track handshake completes.
#[derive(Debug, Clone)]
pub struct Publication {
    /// Client-generated track id, the rendezvous key for the add-track
    /// acknowledgment.
    pub cid: String,
    pub name: String,
    pub kind: TrackKind,
    pub source: TrackSource,
    pub dimensions: VideoDimensions,
    pub layers: Vec<VideoLayer>,
}

impl Publication {
    fn new_cid() -> String {
        format!("TR_{}", Uuid::new_v4().simple())
    }

    pub fn video() -> Self {
        let quality = VideoQuality::Medium;
        Self {
            cid: Self::new_cid(),
            name: "camera".to_string(),
            kind: TrackKind::Video,
            source: TrackSource::Camera,
            dimensions: quality.recommended_resolution(),
            layers: vec![VideoLayer::for_quality(quality)],
        }
    }

    pub fn audio() -> Self {
        Self {
            cid: Self::new_cid(),
            name: "microphone".to_string(),
            kind: TrackKind::Audio,
            source: TrackSource::Microphone,
            dimensions: VideoDimensions::new(0, 0),
            layers: Vec::new(),
        }
    }
}

/// A remote media stream surfaced by the subscribing peer connection.
///
/// Stream ids arrive as `<participant_sid>|<track_sid>`; the participant
/// portion keys the room's stream registry.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteStream {
    pub participant_sid: String,
    pub track_ids: Vec<String>,
}

impl RemoteStream {
    /// Split a wire stream id into participant and track components.
    pub fn parse_stream_id(stream_id: &str) -> (&str, Option<&str>) {
        match stream_id.split_once('|') {
            Some((participant, track)) => (participant, Some(track)),
            None => (stream_id, None),
        }
    }
}

/// One encoded video access unit handed to the publish loop.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Annex-B encoded access unit.
    pub data: bytes::Bytes,
    /// Frame duration on the capture clock.
    pub duration: std::time::Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publication_cids_are_unique() {
        let a = Publication::video();
        let b = Publication::video();
        assert_ne!(a.cid, b.cid);
        assert!(a.cid.starts_with("TR_"));
    }

    #[test]
    fn test_stream_id_parsing() {
        let (participant, track) = RemoteStream::parse_stream_id("PA_dQDLmN3aFt92|TR_VCcdbkcz");
        assert_eq!(participant, "PA_dQDLmN3aFt92");
        assert_eq!(track, Some("TR_VCcdbkcz"));

        let (participant, track) = RemoteStream::parse_stream_id("PA_solo");
        assert_eq!(participant, "PA_solo");
        assert_eq!(track, None);
    }

    #[test]
    fn test_quality_presets() {
        assert_eq!(
            VideoQuality::High.recommended_resolution(),
            VideoDimensions::new(1920, 1080)
        );
        assert!(
            VideoQuality::Low.recommended_bitrate_kbps()
                < VideoQuality::High.recommended_bitrate_kbps()
        );
    }
}
