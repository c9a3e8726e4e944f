use std::io::{ErrorKind, Read};

use crate::error::{GbError, Result};

/// Samples carried by one AAC frame.
pub const SAMPLES_PER_FRAME: u64 = 1024;

/// Fixed header size without CRC.
const HEADER_LEN: usize = 7;

/// How far ahead of the next frame to look before decoding its header.
const PEEK_WINDOW: usize = HEADER_LEN + 1024;

const READ_CHUNK: usize = 4096;

/// `sampling_frequency_index` → Hz (ISO/IEC 14496-3 Table 1.18).
const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Decoded ADTS fixed and variable header (ISO/IEC 13818-7 §6.2).
///
/// ```text
/// AAAAAAAA AAAABCCD EEFFFFGH HHIJKLMM MMMMMMMM MMMOOOOO OOOOOOPP
/// A sync, B id, C layer, D protection_absent, E profile,
/// F sampling_frequency_index, H channel_configuration,
/// M frame_length (header included), P raw data blocks - 1
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    /// `profile` + 1, i.e. the MPEG-4 audio object type (2 = AAC LC).
    pub object_type: u8,
    pub sample_rate: u32,
    pub channels: u8,
    /// Whole frame length in bytes, header included.
    pub frame_length: usize,
}

impl AdtsHeader {
    pub fn parse(b: &[u8]) -> Result<Self> {
        if b.len() < HEADER_LEN {
            return Err(GbError::InvalidBitstream(format!(
                "ADTS header needs {HEADER_LEN} bytes, got {}",
                b.len()
            )));
        }
        if b[0] != 0xFF || b[1] & 0xF0 != 0xF0 {
            return Err(GbError::InvalidBitstream(format!(
                "ADTS syncword missing, got {:02x}{:02x}",
                b[0], b[1]
            )));
        }

        let protection_absent = b[1] & 0x01 == 1;
        let profile = (b[2] >> 6) & 0x03;
        let sf_index = usize::from((b[2] >> 2) & 0x0F);
        let channels = ((b[2] & 0x01) << 2) | (b[3] >> 6);
        let frame_length = (usize::from(b[3] & 0x03) << 11)
            | (usize::from(b[4]) << 3)
            | usize::from(b[5] >> 5);

        let sample_rate = *SAMPLE_RATES.get(sf_index).ok_or_else(|| {
            GbError::InvalidBitstream(format!("ADTS sampling_frequency_index {sf_index}"))
        })?;

        let header_len = if protection_absent { HEADER_LEN } else { HEADER_LEN + 2 };
        if frame_length < header_len {
            return Err(GbError::InvalidBitstream(format!(
                "ADTS frame_length {frame_length} shorter than its header"
            )));
        }

        Ok(AdtsHeader {
            object_type: profile + 1,
            sample_rate,
            channels,
            frame_length,
        })
    }
}

/// Pulls ADTS frames from a byte source.
///
/// Each call peeks a window ahead, decodes the header to learn how long the
/// next frame is, and discards exactly that many bytes. The frame is
/// returned whole, header included, since the PS audio stream carries ADTS.
pub struct AdtsReader<R> {
    reader: R,
    buf: Vec<u8>,
    eof: bool,
    config: AdtsHeader,
}

impl<R: Read> AdtsReader<R> {
    /// Fails if the stream does not start with a valid ADTS header.
    pub fn new(reader: R) -> Result<Self> {
        let mut v = AdtsReader {
            reader,
            buf: Vec::with_capacity(READ_CHUNK * 2),
            eof: false,
            config: AdtsHeader {
                object_type: 0,
                sample_rate: 0,
                channels: 0,
                frame_length: 0,
            },
        };

        let config = AdtsHeader::parse(v.peek(PEEK_WINDOW)?)?;
        v.config = config;
        tracing::debug!(
            sample_rate = v.config.sample_rate,
            channels = v.config.channels,
            object_type = v.config.object_type,
            "ADTS stream"
        );
        Ok(v)
    }

    /// Stream configuration decoded from the first frame.
    pub fn config(&self) -> AdtsHeader {
        self.config
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    /// Up to `n` buffered bytes, reading more from the source as needed.
    fn peek(&mut self, n: usize) -> Result<&[u8]> {
        let mut chunk = [0u8; READ_CHUNK];
        while self.buf.len() < n && !self.eof {
            match self.reader.read(&mut chunk) {
                Ok(0) => self.eof = true,
                Ok(read) => self.buf.extend_from_slice(&chunk[..read]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(&self.buf[..n.min(self.buf.len())])
    }

    /// The next frame, or [`GbError::EndOfStream`] when the source is
    /// exhausted. A truncated final frame also ends the stream.
    pub fn next_frame(&mut self) -> Result<Vec<u8>> {
        let window = self.peek(PEEK_WINDOW)?;
        if window.is_empty() {
            return Err(GbError::EndOfStream);
        }
        if window.len() < HEADER_LEN {
            tracing::warn!(bytes = window.len(), "ignore trailing bytes after last ADTS frame");
            return Err(GbError::EndOfStream);
        }

        let frame_length = AdtsHeader::parse(window)?.frame_length;
        if self.peek(frame_length)?.len() < frame_length {
            tracing::warn!(frame_length, available = self.buf.len(), "truncated ADTS frame");
            return Err(GbError::EndOfStream);
        }

        Ok(self.buf.drain(..frame_length).collect())
    }
}

#[cfg(test)]
pub(crate) fn adts_frame(payload_len: usize) -> Vec<u8> {
    // AAC LC, 44.1 kHz, stereo, no CRC.
    let frame_length = HEADER_LEN + payload_len;
    let mut frame = vec![
        0xFF,
        0xF1,
        (1 << 6) | (4 << 2),
        (2 << 6) | ((frame_length >> 11) & 0x03) as u8,
        ((frame_length >> 3) & 0xFF) as u8,
        (((frame_length & 0x07) << 5) as u8) | 0x1F,
        0xFC,
    ];
    frame.extend(std::iter::repeat_n(0x21, payload_len));
    frame
}
