//! SDP offer reading (RFC 4566 / RFC 8866, GB28181 extensions).
//!
//! A platform's INVITE carries an offer such as:
//!
//! ```text
//! v=0                                            ← protocol version
//! o=34020000002000000001 0 0 IN IP4 10.0.0.1      ← origin
//! s=Play                                          ← session name
//! c=IN IP4 10.0.0.1                               ← connection address
//! t=0 0                                           ← timing
//! m=video 9000 TCP/RTP/AVP 96                     ← media port for PS over RTP
//! a=rtpmap:96 PS/90000
//! a=recvonly
//! y=0100000001                                    ← GB28181 SSRC (decimal)
//! ```
//!
//! Only two fields matter to the device: `y=` and the port of `m=video`.

use crate::error::{GbError, Result};

/// The media parameters a device needs from an INVITE offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaOffer {
    pub ssrc: u32,
    pub media_port: u16,
}

/// Iterate `(type, value)` pairs, splitting each line on the first `=`.
fn fields(sdp: &str) -> impl Iterator<Item = (&str, &str)> {
    sdp.lines()
        .map(str::trim)
        .filter_map(|line| line.split_once('='))
}

/// Extract `y=<ssrc>` and the `m=video <port> ...` port from an offer.
pub fn parse_offer(sdp: &str) -> Result<MediaOffer> {
    let mut ssrc = None;
    let mut media_port = None;

    for (kind, value) in fields(sdp) {
        match kind {
            "y" if ssrc.is_none() => {
                let parsed = value.trim().parse::<u32>().map_err(|_| {
                    GbError::Protocol(format!("parse ssrc={value}, sdp {sdp}"))
                })?;
                ssrc = Some(parsed);
            }
            "m" if media_port.is_none() => {
                let mut parts = value.split_whitespace();
                if parts.next() != Some("video") {
                    continue;
                }
                let port = parts.next().unwrap_or("");
                let parsed = port.parse::<u16>().map_err(|_| {
                    GbError::Protocol(format!("parse media port={port}, sdp {sdp}"))
                })?;
                media_port = Some(parsed);
            }
            _ => {}
        }
    }

    match (ssrc, media_port) {
        (Some(ssrc), Some(media_port)) => Ok(MediaOffer { ssrc, media_port }),
        (None, _) => Err(GbError::Protocol(format!("no y= line in sdp {sdp}"))),
        (_, None) => Err(GbError::Protocol(format!("no m=video line in sdp {sdp}"))),
    }
}
