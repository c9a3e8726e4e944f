//! H.265 (HEVC) NAL unit reading.
//!
//! Key differences from H.264:
//!
//! - **2-byte NAL unit header** (vs 1-byte in H.264):
//!
//!   ```text
//!   +---------------+---------------+
//!   |0|1|2|3|4|5|6|7|0|1|2|3|4|5|6|7|
//!   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!   |F|   Type    |  LayerId  | TID |
//!   +-------------+-----------------+
//!   ```
//!
//! - **Three parameter sets**: VPS (32), SPS (33), PPS (34).
//!
//! - **Two SEI types**: prefix (39) and suffix (40). Both are dropped.

use std::io::Read;

use super::annexb::AnnexBReader;
use super::{NalReader, VideoCodec, VideoUnit};
use crate::error::{GbError, Result};

/// H.265 `nal_unit_type` (ITU-T H.265 Table 7-1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H265NalType {
    /// Coded slice segment, types 0..=31.
    Vcl(u8),
    Vps,
    Sps,
    Pps,
    AccessUnitDelimiter,
    EndOfSequence,
    EndOfBitstream,
    FillerData,
    PrefixSei,
    SuffixSei,
    Other(u8),
}

impl From<u8> for H265NalType {
    fn from(value: u8) -> Self {
        match value {
            0..=31 => H265NalType::Vcl(value),
            32 => H265NalType::Vps,
            33 => H265NalType::Sps,
            34 => H265NalType::Pps,
            35 => H265NalType::AccessUnitDelimiter,
            36 => H265NalType::EndOfSequence,
            37 => H265NalType::EndOfBitstream,
            38 => H265NalType::FillerData,
            39 => H265NalType::PrefixSei,
            40 => H265NalType::SuffixSei,
            other => H265NalType::Other(other),
        }
    }
}

impl H265NalType {
    pub fn is_sei(self) -> bool {
        matches!(self, H265NalType::PrefixSei | H265NalType::SuffixSei)
    }

    pub fn is_parameter_set(self) -> bool {
        matches!(self, H265NalType::Vps | H265NalType::Sps | H265NalType::Pps)
    }
}

/// One H.265 NAL unit.
#[derive(Debug, Clone)]
pub struct Nal {
    pub forbidden_zero_bit: bool,
    pub unit_type: H265NalType,
    pub layer_id: u8,
    pub temporal_id_plus1: u8,
    /// Header and payload.
    pub data: Vec<u8>,
}

impl Nal {
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let &[b0, b1, ..] = data.as_slice() else {
            return Err(GbError::InvalidBitstream(format!(
                "H.265 NAL unit of {} bytes has no 2-byte header",
                data.len()
            )));
        };
        Ok(Nal {
            forbidden_zero_bit: b0 & 0x80 != 0,
            unit_type: H265NalType::from((b0 >> 1) & 0x3f),
            layer_id: ((b0 & 0x01) << 5) | (b1 >> 3),
            temporal_id_plus1: b1 & 0x07,
            data,
        })
    }
}

/// Reads H.265 NAL units from an Annex B file, dropping SEI.
pub struct H265Reader<R> {
    inner: AnnexBReader<R>,
}

impl<R: Read> H265Reader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: AnnexBReader::new(reader),
        }
    }

    pub fn next_nal(&mut self) -> Result<Nal> {
        loop {
            let nal = Nal::parse(self.inner.next_nal()?)?;
            if nal.unit_type.is_sei() {
                continue;
            }
            tracing::trace!(
                unit_type = ?nal.unit_type,
                forbidden_zero_bit = nal.forbidden_zero_bit,
                layer_id = nal.layer_id,
                tid = nal.temporal_id_plus1,
                bytes = nal.data.len(),
                "H.265 NALU"
            );
            return Ok(nal);
        }
    }
}

impl<R: Read + Send> NalReader for H265Reader<R> {
    fn codec(&self) -> VideoCodec {
        VideoCodec::H265
    }

    fn next_unit(&mut self) -> Result<VideoUnit> {
        let nal = self.next_nal()?;
        Ok(VideoUnit {
            parameter_set: nal.unit_type.is_parameter_set(),
            data: nal.data,
        })
    }
}
