/// Largest RTP payload carried per packet. Keeps UDP datagrams under a
/// typical 1500-byte Ethernet MTU.
pub const MAX_PAYLOAD: usize = 1400;

/// RTP fixed header builder (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The SSRC is the one the platform assigned in the INVITE's `y=` line, so
/// unlike a standalone sender it is never chosen randomly here. The
/// timestamp is supplied per pack (its DTS on the 90 kHz clock); the
/// sequence number is 16-bit and wraps.
#[derive(Debug)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551). GB28181 PS uses dynamic 96.
    pub pt: u8,
    pub ssrc: u32,
    sequence: u16,
}

impl RtpHeader {
    pub fn new(pt: u8, ssrc: u32) -> Self {
        tracing::debug!(
            pt,
            ssrc = format_args!("{:#010X}", ssrc),
            "RTP header state created"
        );
        Self {
            pt: pt & 0x7f,
            ssrc,
            sequence: 0,
        }
    }

    /// Sequence number the next [`write`](Self::write) will use.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Serialize a 12-byte header and advance the sequence number.
    pub fn write(&mut self, marker: bool, timestamp: u32) -> [u8; 12] {
        let first_byte: u8 = 2 << 6;
        let second_byte: u8 = ((marker as u8) << 7) | self.pt;

        let mut header = [0u8; 12];
        header[0] = first_byte;
        header[1] = second_byte;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        header
    }

    /// Split one PS pack into RTP packets of at most [`MAX_PAYLOAD`] bytes.
    ///
    /// All packets share `timestamp`. The marker bit is set on the last
    /// packet of the pack, i.e. the end of the access unit.
    pub fn packetize(&mut self, payload: &[u8], timestamp: u32) -> Vec<Vec<u8>> {
        let chunks: Vec<&[u8]> = payload.chunks(MAX_PAYLOAD).collect();
        let last = chunks.len().saturating_sub(1);

        let packets: Vec<Vec<u8>> = chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                let hdr = self.write(i == last, timestamp);
                let mut packet = Vec::with_capacity(12 + chunk.len());
                packet.extend_from_slice(&hdr);
                packet.extend_from_slice(chunk);
                packet
            })
            .collect();

        tracing::trace!(
            pack_bytes = payload.len(),
            rtp_packets = packets.len(),
            seq = self.sequence,
            ts = timestamp,
            "pack packetized"
        );
        packets
    }
}
