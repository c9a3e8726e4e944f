use std::io::Read;

use super::annexb::AnnexBReader;
use super::{NalReader, VideoCodec, VideoUnit};
use crate::error::{GbError, Result};

/// H.264 `nal_unit_type` (ITU-T H.264 Table 7-1), the values this device
/// distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H264NalType {
    Slice,
    SliceIdr,
    Sei,
    Sps,
    Pps,
    AccessUnitDelimiter,
    Other(u8),
}

impl From<u8> for H264NalType {
    fn from(value: u8) -> Self {
        match value & 0x1f {
            1 => H264NalType::Slice,
            5 => H264NalType::SliceIdr,
            6 => H264NalType::Sei,
            7 => H264NalType::Sps,
            8 => H264NalType::Pps,
            9 => H264NalType::AccessUnitDelimiter,
            other => H264NalType::Other(other),
        }
    }
}

/// An H.264 NAL unit with its one-byte header decoded.
///
/// ```text
/// +---------------+
/// |0|1|2|3|4|5|6|7|
/// +-+-+-+-+-+-+-+-+
/// |F|NRI|  Type   |
/// +---------------+
/// ```
#[derive(Debug, Clone)]
pub struct H264Nal {
    pub forbidden_zero_bit: bool,
    pub ref_idc: u8,
    pub unit_type: H264NalType,
    pub data: Vec<u8>,
}

impl H264Nal {
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let header = *data
            .first()
            .ok_or_else(|| GbError::InvalidBitstream("empty H.264 NAL unit".to_string()))?;
        Ok(H264Nal {
            forbidden_zero_bit: header & 0x80 != 0,
            ref_idc: (header >> 5) & 0x03,
            unit_type: H264NalType::from(header),
            data,
        })
    }

    pub fn is_parameter_set(&self) -> bool {
        matches!(self.unit_type, H264NalType::Sps | H264NalType::Pps)
    }
}

/// Reads H.264 NAL units from an Annex B file, dropping SEI.
pub struct H264Reader<R> {
    inner: AnnexBReader<R>,
}

impl<R: Read> H264Reader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: AnnexBReader::new(reader),
        }
    }

    pub fn next_nal(&mut self) -> Result<H264Nal> {
        loop {
            let nal = H264Nal::parse(self.inner.next_nal()?)?;
            if nal.unit_type == H264NalType::Sei {
                continue;
            }
            tracing::trace!(
                unit_type = ?nal.unit_type,
                forbidden_zero_bit = nal.forbidden_zero_bit,
                ref_idc = nal.ref_idc,
                bytes = nal.data.len(),
                "H.264 NALU"
            );
            return Ok(nal);
        }
    }
}

impl<R: Read + Send> NalReader for H264Reader<R> {
    fn codec(&self) -> VideoCodec {
        VideoCodec::H264
    }

    fn next_unit(&mut self) -> Result<VideoUnit> {
        let nal = self.next_nal()?;
        Ok(VideoUnit {
            parameter_set: nal.is_parameter_set(),
            data: nal.data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::annexb::annexb_stream;
    use std::io::Cursor;

    #[test]
    fn header_fields() {
        let nal = H264Nal::parse(vec![0x67, 0x42]).unwrap();
        assert!(!nal.forbidden_zero_bit);
        assert_eq!(nal.ref_idc, 3);
        assert_eq!(nal.unit_type, H264NalType::Sps);
        assert!(nal.is_parameter_set());

        let nal = H264Nal::parse(vec![0x41]).unwrap();
        assert_eq!(nal.ref_idc, 2);
        assert_eq!(nal.unit_type, H264NalType::Slice);
        assert!(!nal.is_parameter_set());
    }

    #[test]
    fn skips_sei() {
        let data = annexb_stream(&[&[0x67, 0x42], &[0x06, 0x05, 0xFF], &[0x68, 0xCE], &[0x65, 0x88]]);
        let mut r = H264Reader::new(Cursor::new(data));
        let types: Vec<H264NalType> = std::iter::from_fn(|| r.next_nal().ok())
            .map(|n| n.unit_type)
            .collect();
        assert_eq!(
            types,
            vec![H264NalType::Sps, H264NalType::Pps, H264NalType::SliceIdr]
        );
    }

    #[test]
    fn trait_reports_parameter_sets() {
        let data = annexb_stream(&[&[0x68, 0xCE], &[0x41, 0x9A]]);
        let mut r: Box<dyn NalReader> = Box::new(H264Reader::new(Cursor::new(data)));
        assert_eq!(r.codec(), VideoCodec::H264);
        assert!(r.next_unit().unwrap().parameter_set);
        let slice = r.next_unit().unwrap();
        assert!(!slice.parameter_set);
        assert_eq!(slice.data, vec![0x41, 0x9A]);
        assert!(r.next_unit().unwrap_err().is_end_of_stream());
    }
}
