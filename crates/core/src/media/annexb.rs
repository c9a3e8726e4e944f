use std::io::{BufRead, BufReader, Read};

use crate::error::{GbError, Result};

const READ_BUFFER: usize = 4096;

/// Splits an Annex B byte stream into NAL units (ITU-T H.264/H.265 Annex B).
///
/// ```text
/// 00 00 00 01 | NAL | 00 00 01 | NAL | 00 00 00 01 | NAL ...
/// ```
///
/// Bytes are scanned one at a time while counting consecutive zeros. A
/// `0x01` after two or more zeros ends a start code: the zeros are trimmed
/// off the accumulated bytes, which are then the completed unit. The first
/// call consumes the leading start code before splitting begins.
///
/// Emulation prevention bytes are left in place; units are returned as they
/// appear on the wire, header included, start code excluded.
pub struct AnnexBReader<R> {
    reader: BufReader<R>,
    nal: Vec<u8>,
    zeros: usize,
    prefix_parsed: bool,
}

impl<R: Read> AnnexBReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::with_capacity(READ_BUFFER, reader),
            nal: Vec::new(),
            zeros: 0,
            prefix_parsed: false,
        }
    }

    /// Consume the leading `00 00 01` or `00 00 00 01`.
    fn parse_prefix(&mut self) -> Result<()> {
        let mut zeros = 0usize;
        let mut byte = [0u8; 1];
        loop {
            if self.reader.read(&mut byte)? == 0 {
                return Err(GbError::InvalidBitstream(format!(
                    "stream ended after {zeros} bytes, before the first start code"
                )));
            }
            match byte[0] {
                0 => zeros += 1,
                1 if zeros >= 2 => break,
                b => {
                    return Err(GbError::InvalidBitstream(format!(
                        "stream does not begin with a start code (byte {b:#04x} after {zeros} zeros)"
                    )));
                }
            }
        }
        self.prefix_parsed = true;
        Ok(())
    }

    /// The next NAL unit, or [`GbError::EndOfStream`] once the input is
    /// exhausted.
    pub fn next_nal(&mut self) -> Result<Vec<u8>> {
        if !self.prefix_parsed {
            self.parse_prefix()?;
        }

        loop {
            let buf = self.reader.fill_buf()?;
            if buf.is_empty() {
                self.zeros = 0;
                if self.nal.is_empty() {
                    return Err(GbError::EndOfStream);
                }
                return Ok(std::mem::take(&mut self.nal));
            }

            let mut consumed = 0;
            let mut completed = None;
            for &b in buf {
                consumed += 1;
                match b {
                    0 => {
                        self.zeros += 1;
                        self.nal.push(0);
                    }
                    1 if self.zeros >= 2 => {
                        // Trailing zeros belong to the start code, not the unit.
                        let len = self.nal.len() - self.zeros;
                        self.nal.truncate(len);
                        self.zeros = 0;
                        completed = Some(std::mem::take(&mut self.nal));
                        break;
                    }
                    _ => {
                        self.zeros = 0;
                        self.nal.push(b);
                    }
                }
            }
            self.reader.consume(consumed);

            match completed {
                Some(nal) if !nal.is_empty() => return Ok(nal),
                _ => continue,
            }
        }
    }
}

/// Join units with 4-byte start codes. Test helper for building streams.
#[cfg(test)]
pub(crate) fn annexb_stream(units: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for unit in units {
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(unit);
    }
    out
}
