//! Network transport for GB28181 signaling and media delivery.
//!
//! GB28181 uses a split transport model:
//!
//! - **TCP signaling** ([`tcp`]): one SIP connection per emulated device.
//!   Messages are framed by their `Content-Length` header. The
//!   [`Correlator`](crate::session::Correlator) owns the connection and
//!   a reader thread on top of it.
//!
//! - **RTP media** ([`media`]): PS packs carried as RTP to the port the
//!   platform offered in its INVITE, over TCP (RFC 4571 length framing)
//!   or UDP.

pub mod media;
pub mod tcp;

pub use media::{MediaSender, build_media_addr};
pub use tcp::Endpoint;
