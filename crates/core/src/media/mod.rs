//! Elementary stream readers, PS muxing and RTP packetization.
//!
//! The ingestion loop pulls frames from two files and turns them into
//! RTP-carried MPEG program stream packs:
//!
//! ```text
//! .h264/.h265 ──► AnnexBReader ──► H264Reader / H265Reader ─┐
//!                                                            ├─► PsPack ──► RtpHeader ──► MediaSender
//! .aac ─────────────────────────► AdtsReader ───────────────┘
//! ```
//!
//! | Stage | Module | Reference |
//! |-------|--------|-----------|
//! | Annex B splitting | [`annexb`] | ITU-T H.264 / H.265 Annex B |
//! | H.264 NAL header | [`h264`] | ITU-T H.264 §7.3.1 |
//! | H.265 NAL header | [`h265`] | ITU-T H.265 §7.3.1.2 |
//! | ADTS framing | [`aac`] | ISO/IEC 13818-7 §6.2 |
//! | Program stream | [`ps`] | ISO/IEC 13818-1 §2.5 |
//! | RTP | [`rtp`] | RFC 3550 |
//! | Pacing | [`clock`] | |

pub mod aac;
pub mod annexb;
pub mod clock;
pub mod h264;
pub mod h265;
pub mod ps;
pub mod rtp;

use std::fs::File;
use std::path::Path;

use crate::error::{GbError, Result};

/// Video codec of an elementary stream file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
}

impl VideoCodec {
    /// `.h265` selects HEVC; anything else is treated as AVC.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("h265") => VideoCodec::H265,
            _ => VideoCodec::H264,
        }
    }

    /// `stream_type` in the program stream map (ISO/IEC 13818-1 Table 2-34).
    pub fn stream_type(self) -> u8 {
        match self {
            VideoCodec::H264 => 0x1b,
            VideoCodec::H265 => 0x24,
        }
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoCodec::H264 => f.write_str("H264"),
            VideoCodec::H265 => f.write_str("H265"),
        }
    }
}

/// One NAL unit as the ingestion loop sees it, regardless of codec.
#[derive(Debug, Clone)]
pub struct VideoUnit {
    /// SPS/PPS (and VPS for H.265).
    pub parameter_set: bool,
    /// Header and payload, without start code.
    pub data: Vec<u8>,
}

/// Source of video NAL units.
///
/// Each supported codec implements this trait on top of
/// [`annexb::AnnexBReader`]. Implementations skip SEI units; the
/// ingestion loop never sees them.
pub trait NalReader: Send {
    fn codec(&self) -> VideoCodec;

    /// Next unit, or [`GbError::EndOfStream`] at end of file.
    fn next_unit(&mut self) -> Result<VideoUnit>;
}

/// Open a video file and pick the reader from its extension.
pub fn open_video(path: &Path) -> Result<Box<dyn NalReader>> {
    let file = File::open(path)
        .map_err(|e| GbError::from(e).wrap(format!("open {}", path.display())))?;
    Ok(match VideoCodec::from_path(path) {
        VideoCodec::H264 => Box::new(h264::H264Reader::new(file)),
        VideoCodec::H265 => Box::new(h265::H265Reader::new(file)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_from_extension() {
        assert_eq!(VideoCodec::from_path(Path::new("avatar.h265")), VideoCodec::H265);
        assert_eq!(VideoCodec::from_path(Path::new("a/b/AVATAR.H265")), VideoCodec::H265);
        assert_eq!(VideoCodec::from_path(Path::new("avatar.h264")), VideoCodec::H264);
        assert_eq!(VideoCodec::from_path(Path::new("avatar")), VideoCodec::H264);
    }

    #[test]
    fn open_missing_file_names_path() {
        let err = open_video(Path::new("/nonexistent/avatar.h264")).err().unwrap();
        assert!(err.to_string().contains("/nonexistent/avatar.h264"));
    }
}
