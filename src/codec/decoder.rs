//! Decodable-frame assembly on top of the NAL unit scanner.
//!
//! Each call to [`FrameAssembler::push_access_unit`] takes one encoded
//! access unit in Annex-B form, refreshes the decoder configuration from
//! any parameter sets it carries, and emits the remaining units as a
//! single length-prefixed frame tagged with a 90 kHz presentation
//! timestamp. Assembly failures drop the current access unit and never
//! abort the decode loop.

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use super::nalu::{NaluKind, NaluSequence};

/// Ticks per millisecond of the 90 kHz media clock.
const CLOCK_90KHZ_PER_MS: i64 = 90;

/// Decoder configuration assembled from SPS/PPS parameter sets, the
/// equivalent of a video format description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Parameter set payloads in arrival order (SPS first, then PPS).
    pub parameter_sets: Vec<Bytes>,
    /// Size of the length prefix in assembled frames.
    pub nal_length_size: u8,
}

/// One decodable frame: the length-prefixed units of a single access unit.
#[derive(Debug, Clone)]
pub struct DecodableFrame {
    pub data: Bytes,
    /// Presentation timestamp on a 90 kHz clock.
    pub pts: i64,
    pub keyframe: bool,
}

/// Assembles decodable frames out of raw access units.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    config: Option<DecoderConfig>,
    pending_sps: Option<Bytes>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently assembled decoder configuration, if any access
    /// unit so far carried a complete SPS/PPS pair.
    pub fn config(&self) -> Option<&DecoderConfig> {
        self.config.as_ref()
    }

    /// Process one Annex-B access unit stamped with a source timestamp in
    /// milliseconds. Returns the assembled frame, or `None` when the unit
    /// carried no picture data or no configuration is available yet.
    pub fn push_access_unit(&mut self, buf: &[u8], timestamp_ms: i64) -> Option<DecodableFrame> {
        let mut data = BytesMut::new();
        let mut keyframe = false;

        for nalu in NaluSequence::new(buf) {
            match nalu.kind() {
                NaluKind::Sps => {
                    self.pending_sps = Some(Bytes::copy_from_slice(nalu.payload()));
                }
                NaluKind::Pps => match self.pending_sps.take() {
                    Some(sps) => {
                        self.config = Some(DecoderConfig {
                            parameter_sets: vec![sps, Bytes::copy_from_slice(nalu.payload())],
                            nal_length_size: super::nalu::LENGTH_PREFIX_SIZE as u8,
                        });
                    }
                    None => {
                        warn!("picture parameter set without a preceding sequence parameter set");
                    }
                },
                kind => {
                    keyframe |= kind.is_keyframe();
                    data.extend_from_slice(&nalu.to_length_prefixed());
                }
            }
        }

        if data.is_empty() {
            return None;
        }

        if self.config.is_none() {
            // likely mid-stream join before the first keyframe
            debug!("dropping access unit: no decoder configuration yet");
            return None;
        }

        Some(DecodableFrame {
            data: data.freeze(),
            pts: timestamp_ms * CLOCK_90KHZ_PER_MS,
            keyframe,
        })
    }
}
