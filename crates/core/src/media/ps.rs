//! MPEG-2 program stream muxing (ISO/IEC 13818-1 §2.5).
//!
//! GB28181 carries media as a program stream over RTP. A pack is laid out:
//!
//! ```text
//! 00 00 01 BA  pack header (SCR = DTS)          ← every pack
//! 00 00 01 BB  system header                    ← packs starting with parameter sets
//! 00 00 01 BC  program stream map (+ CRC32)     ← same
//! 00 00 01 E0  video PES (Annex B NAL)          ← one or more per access unit
//! 00 00 01 C0  audio PES (ADTS frame)           ← one per AAC frame
//! ```

use super::VideoCodec;

pub const STREAM_ID_VIDEO: u8 = 0xE0;
pub const STREAM_ID_AUDIO: u8 = 0xC0;

/// `stream_type` for ADTS AAC (ISO/IEC 13818-7).
const STREAM_TYPE_AAC: u8 = 0x0F;

/// Multiplex rate in units of 50 bytes/s.
const MUX_RATE: u32 = 6106;

/// PES header bytes after `PES_packet_length`: flags (2), header length
/// (1), PTS (5).
const PES_HEADER_AFTER_LENGTH: usize = 3 + 5;

/// Largest PES payload that fits the 16-bit `PES_packet_length`.
pub const MAX_PES_PAYLOAD: usize = u16::MAX as usize - PES_HEADER_AFTER_LENGTH;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// What a [`PsPacket`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsPacketKind {
    /// Pack header, optionally followed by system header and stream map.
    Header,
    Video,
    Audio,
}

#[derive(Debug, Clone)]
pub struct PsPacket {
    pub kind: PsPacketKind,
    pub dts: u64,
    pub data: Vec<u8>,
}

/// One program stream pack under construction.
///
/// Holds at most one video access unit and any number of audio frames.
#[derive(Debug, Default)]
pub struct PsPack {
    packets: Vec<PsPacket>,
    has_video: bool,
    dts: Option<u64>,
}

impl PsPack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_video(&self) -> bool {
        self.has_video
    }

    /// Timestamp of the pack header, the RTP timestamp of the whole pack.
    pub fn dts(&self) -> u64 {
        self.dts.unwrap_or(0)
    }

    pub fn packets(&self) -> &[PsPacket] {
        &self.packets
    }

    /// The pack as one contiguous program stream segment.
    pub fn to_bytes(&self) -> Vec<u8> {
        let len = self.packets.iter().map(|p| p.data.len()).sum();
        let mut out = Vec::with_capacity(len);
        for p in &self.packets {
            out.extend_from_slice(&p.data);
        }
        out
    }

    /// Pack header, system header and stream map naming `codec` and AAC.
    /// Written before an access unit that carries parameter sets.
    pub fn write_header(&mut self, codec: VideoCodec, dts: u64) {
        let mut data = pack_header(dts);
        data.extend_from_slice(&system_header());
        data.extend_from_slice(&stream_map(codec));
        self.push(PsPacketKind::Header, dts, data);
    }

    /// Pack header only.
    pub fn write_pack_header(&mut self, dts: u64) {
        self.push(PsPacketKind::Header, dts, pack_header(dts));
    }

    /// One NAL unit as video PES, with a start code prepended.
    pub fn write_video(&mut self, nal: &[u8], dts: u64) {
        let mut es = Vec::with_capacity(START_CODE.len() + nal.len());
        es.extend_from_slice(&START_CODE);
        es.extend_from_slice(nal);
        self.has_video = true;
        self.push(PsPacketKind::Video, dts, pes(STREAM_ID_VIDEO, &es, dts));
    }

    /// One ADTS frame as audio PES.
    pub fn write_audio(&mut self, frame: &[u8], dts: u64) {
        self.push(PsPacketKind::Audio, dts, pes(STREAM_ID_AUDIO, frame, dts));
    }

    fn push(&mut self, kind: PsPacketKind, dts: u64, data: Vec<u8>) {
        if self.dts.is_none() {
            self.dts = Some(dts);
        }
        self.packets.push(PsPacket { kind, dts, data });
    }
}

/// 14-byte MPEG-2 pack header with SCR base = `scr`, extension 0.
fn pack_header(scr: u64) -> Vec<u8> {
    let scr_ext: u16 = 0;
    vec![
        0x00,
        0x00,
        0x01,
        0xBA,
        0x40 | (((scr >> 30) & 0x07) as u8) << 3 | 0x04 | ((scr >> 28) & 0x03) as u8,
        ((scr >> 20) & 0xFF) as u8,
        (((scr >> 15) & 0x1F) as u8) << 3 | 0x04 | ((scr >> 13) & 0x03) as u8,
        ((scr >> 5) & 0xFF) as u8,
        ((scr & 0x1F) as u8) << 3 | 0x04 | ((scr_ext >> 7) & 0x03) as u8,
        ((scr_ext & 0x7F) as u8) << 1 | 0x01,
        ((MUX_RATE >> 14) & 0xFF) as u8,
        ((MUX_RATE >> 6) & 0xFF) as u8,
        ((MUX_RATE & 0x3F) as u8) << 2 | 0x03,
        0xF8,
    ]
}

/// System header declaring one video and one audio stream.
fn system_header() -> Vec<u8> {
    let rate_bound = MUX_RATE;
    let mut h = vec![
        0x00,
        0x00,
        0x01,
        0xBB,
        0x00,
        0x0C,
        0x80 | ((rate_bound >> 15) & 0x7F) as u8,
        ((rate_bound >> 7) & 0xFF) as u8,
        ((rate_bound & 0x7F) as u8) << 1 | 0x01,
        // audio_bound = 1, fixed = 0, CSPS = 0
        0x04,
        // audio/video lock, marker, video_bound = 1
        0xE1,
        0xFF,
    ];
    // P-STD buffers: video 1024 x 1024 bytes, audio 32 x 128 bytes.
    h.extend_from_slice(&[STREAM_ID_VIDEO, 0xE0 | (1024u16 >> 8) as u8, 0x00]);
    h.extend_from_slice(&[STREAM_ID_AUDIO, 0xC0, 0x20]);
    h
}

/// Program stream map for `codec` video plus AAC audio.
fn stream_map(codec: VideoCodec) -> Vec<u8> {
    let entries = [
        (codec.stream_type(), STREAM_ID_VIDEO),
        (STREAM_TYPE_AAC, STREAM_ID_AUDIO),
    ];
    let es_map_len = (entries.len() * 4) as u16;
    // flags (2) + info length (2) + es map length (2) + entries + CRC (4)
    let psm_len = 2 + 2 + 2 + es_map_len + 4;

    let mut m = vec![0x00, 0x00, 0x01, 0xBC];
    m.extend_from_slice(&psm_len.to_be_bytes());
    // current_next_indicator = 1, version 0; marker
    m.extend_from_slice(&[0xE0, 0xFF]);
    m.extend_from_slice(&0u16.to_be_bytes());
    m.extend_from_slice(&es_map_len.to_be_bytes());
    for (stream_type, stream_id) in entries {
        m.extend_from_slice(&[stream_type, stream_id, 0x00, 0x00]);
    }
    let crc = crc32_mpeg2(&m);
    m.extend_from_slice(&crc.to_be_bytes());
    m
}

/// PES packets for `payload`, split so each fits `PES_packet_length`.
/// Every packet carries PTS = `dts`.
fn pes(stream_id: u8, payload: &[u8], dts: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    for chunk in payload.chunks(MAX_PES_PAYLOAD) {
        let len = (PES_HEADER_AFTER_LENGTH + chunk.len()) as u16;
        out.extend_from_slice(&[0x00, 0x00, 0x01, stream_id]);
        out.extend_from_slice(&len.to_be_bytes());
        // '10', data_alignment_indicator; PTS only; 5 header bytes
        out.extend_from_slice(&[0x84, 0x80, 0x05]);
        out.extend_from_slice(&timestamp(0x2, dts));
        out.extend_from_slice(chunk);
    }
    out
}

/// 33-bit PTS/DTS field with its 4-bit prefix and marker bits.
fn timestamp(prefix: u8, ts: u64) -> [u8; 5] {
    [
        (prefix << 4) | (((ts >> 30) & 0x07) as u8) << 1 | 0x01,
        ((ts >> 22) & 0xFF) as u8,
        (((ts >> 15) & 0x7F) as u8) << 1 | 0x01,
        ((ts >> 7) & 0xFF) as u8,
        ((ts & 0x7F) as u8) << 1 | 0x01,
    ]
}

/// CRC-32/MPEG-2: poly 0x04C11DB7, init all ones, no reflection, no xor.
fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= u32::from(byte) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}
