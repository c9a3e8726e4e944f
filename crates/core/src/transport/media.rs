use std::io::Write;
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::time::Duration;

use crate::error::{GbError, Result};
use crate::media::ps::PsPack;
use crate::media::rtp::RtpHeader;

use super::tcp::Endpoint;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

enum Conn {
    /// RTP over TCP, each packet prefixed with its 16-bit length (RFC 4571).
    Tcp(TcpStream),
    Udp(UdpSocket),
}

/// Delivers PS packs to the platform's media port as RTP.
///
/// Identified by the SSRC the platform assigned and the destination
/// address, `tcp://ip:port` or `udp://ip:port`.
pub struct MediaSender {
    addr: String,
    rtp: RtpHeader,
    conn: Option<Conn>,
    packets_sent: u64,
    bytes_sent: u64,
}

impl MediaSender {
    pub fn new(ssrc: u32, addr: &str, payload_type: u8) -> Self {
        Self {
            addr: addr.to_string(),
            rtp: RtpHeader::new(payload_type, ssrc),
            conn: None,
            packets_sent: 0,
            bytes_sent: 0,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.rtp.ssrc
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// RTP packets written so far.
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Open the media connection. Must be called before
    /// [`write_pack`](Self::write_pack).
    pub fn connect(&mut self) -> Result<()> {
        let endpoint = Endpoint::parse(&self.addr)?;
        let target = endpoint.resolve()?;
        let connect_err = |source| GbError::Connect {
            addr: self.addr.clone(),
            source,
        };

        let conn = match endpoint.scheme.as_str() {
            "tcp" | "tcp4" => {
                let stream = TcpStream::connect_timeout(&target, CONNECT_TIMEOUT).map_err(connect_err)?;
                stream.set_nodelay(true)?;
                Conn::Tcp(stream)
            }
            "udp" | "udp4" => {
                let bind: SocketAddr = if target.is_ipv4() {
                    ([0u8, 0, 0, 0], 0).into()
                } else {
                    ([0u16; 8], 0).into()
                };
                let socket = UdpSocket::bind(bind)?;
                socket.connect(target).map_err(connect_err)?;
                Conn::Udp(socket)
            }
            _ => {
                return Err(GbError::InvalidAddress {
                    addr: self.addr.clone(),
                    reason: "scheme must be tcp or udp",
                });
            }
        };

        tracing::info!(
            addr = %self.addr,
            ssrc = self.rtp.ssrc,
            "media connected"
        );
        self.conn = Some(conn);
        Ok(())
    }

    /// Packetize `pack` and send it. All packets carry the pack DTS as
    /// timestamp; the last one has the marker bit set.
    pub fn write_pack(&mut self, pack: &PsPack) -> Result<usize> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| GbError::Transport(format!("media {} not connected", self.addr)))?;

        // RTP timestamps are 32-bit and wrap.
        let packets = self.rtp.packetize(&pack.to_bytes(), pack.dts() as u32);
        let mut bytes = 0;
        match conn {
            Conn::Tcp(stream) => {
                let total: usize = packets.iter().map(|p| p.len() + 2).sum();
                let mut buf = Vec::with_capacity(total);
                for p in &packets {
                    buf.extend_from_slice(&(p.len() as u16).to_be_bytes());
                    buf.extend_from_slice(p);
                }
                stream.write_all(&buf)?;
                bytes = buf.len();
            }
            Conn::Udp(socket) => {
                for p in &packets {
                    bytes += socket.send(p)?;
                }
            }
        }

        self.packets_sent += packets.len() as u64;
        self.bytes_sent += bytes as u64;
        tracing::trace!(
            rtp_packets = packets.len(),
            bytes,
            dts = pack.dts(),
            "pack sent"
        );
        Ok(packets.len())
    }

    pub fn close(&mut self) {
        if let Some(Conn::Tcp(stream)) = self.conn.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

impl Drop for MediaSender {
    fn drop(&mut self) {
        self.close();
    }
}

/// Media destination for a platform reached at `sip_addr`: same scheme,
/// the resolved IP of the signaling host, and `media_port`.
pub fn build_media_addr(sip_addr: &str, media_port: u16) -> Result<String> {
    let endpoint = Endpoint::parse(sip_addr)?;
    let ip = endpoint.resolve()?.ip();
    Ok(format!(
        "{}://{}",
        endpoint.scheme,
        SocketAddr::new(ip, media_port)
    ))
}
