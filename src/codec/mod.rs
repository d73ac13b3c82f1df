//! Encoded-video bitstream framing.
//!
//! [`nalu`] scans Annex-B byte buffers for unit boundaries and re-frames
//! units into length-prefixed (AVCC) form; [`decoder`] assembles decodable
//! frames and a decoder configuration out of the scanned units.

pub mod decoder;
pub mod nalu;

pub use decoder::{DecodableFrame, DecoderConfig, FrameAssembler};
pub use nalu::{Nalu, NaluKind, NaluSequence};
