//! SIP signaling as used by GB28181 (RFC 3261 subset).
//!
//! This module handles the text-based SIP messages a GB28181 device
//! exchanges with its platform: parsing requests and responses, building
//! the device's own requests, and reading the SDP offer of an INVITE.
//!
//! ## SIP message format (RFC 3261 §7)
//!
//! ```text
//! REGISTER sip:34020000002000000001@3402000000 SIP/2.0\r\n
//! Via: SIP/2.0/TCP 192.168.3.99:5060;branch=z9hG4bK_1234\r\n
//! From: <sip:34020000001320000001@3402000000>;tag=5678\r\n
//! To: <sip:34020000001320000001@3402000000>\r\n
//! Call-ID: 9012\r\n
//! CSeq: 101 REGISTER\r\n
//! Content-Length: 0\r\n
//! \r\n
//! ```
//!
//! ## Exchanges used by the device
//!
//! | Method | Direction | Purpose |
//! |--------|-----------|---------|
//! | REGISTER | device → platform | Register (`Expires: 3600`) or unregister (`Expires: 0`) |
//! | INVITE | platform → device | Ask for media, SDP offer carries `y=<ssrc>` and `m=video <port>` |
//! | ACK | platform → device | Confirms the device's 200 OK to INVITE |
//! | MESSAGE | device → platform | Keepalive, `CmdType=Keepalive` XML body |
//! | BYE | device → platform | Stop the media session |

pub mod headers;
pub mod request;
pub mod response;
pub mod sdp;

use std::fmt;
use std::str::FromStr;

use crate::error::{GbError, ParseErrorKind, Result};

pub use headers::Headers;
pub use request::{RequestBuilder, SipRequest};
pub use response::SipResponse;

/// Protocol version written on every start line.
pub const SIP_VERSION: &str = "SIP/2.0";

/// SIP request method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Message,
    Options,
    Info,
    /// Any method this device does not act on.
    Extension(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Message => "MESSAGE",
            Method::Options => "OPTIONS",
            Method::Info => "INFO",
            Method::Extension(m) => m,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "REGISTER" => Method::Register,
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "MESSAGE" => Method::Message,
            "OPTIONS" => Method::Options,
            "INFO" => Method::Info,
            other => Method::Extension(other.to_string()),
        })
    }
}

/// Any SIP message received from or sent to the platform.
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    /// Parse a complete message: start line, headers, blank line, body.
    pub fn parse(raw: &str) -> Result<Self> {
        let (head, body) = split_head_body(raw.trim_start_matches(['\r', '\n']));
        let mut lines = head.lines();

        let start = lines
            .next()
            .filter(|l| !l.trim().is_empty())
            .ok_or(GbError::Parse {
                kind: ParseErrorKind::EmptyMessage,
            })?;
        let headers = Headers::parse(lines)?;
        let body = body.to_string();

        if start.starts_with(SIP_VERSION) {
            SipResponse::from_parts(start, headers, body).map(SipMessage::Response)
        } else {
            SipRequest::from_parts(start, headers, body).map(SipMessage::Request)
        }
    }

    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(r) => &r.headers,
            SipMessage::Response(r) => &r.headers,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers().call_id()
    }

    pub fn serialize(&self) -> String {
        match self {
            SipMessage::Request(r) => r.serialize(),
            SipMessage::Response(r) => r.serialize(),
        }
    }

    /// Short identifier for logs: `METHOD/Call-ID` or `CODE/Call-ID`.
    pub fn message_id(&self) -> String {
        match self {
            SipMessage::Request(r) => r.message_id(),
            SipMessage::Response(r) => r.message_id(),
        }
    }
}

impl From<SipRequest> for SipMessage {
    fn from(r: SipRequest) -> Self {
        SipMessage::Request(r)
    }
}

impl From<SipResponse> for SipMessage {
    fn from(r: SipResponse) -> Self {
        SipMessage::Response(r)
    }
}

fn split_head_body(raw: &str) -> (&str, &str) {
    if let Some(pos) = raw.find("\r\n\r\n") {
        (&raw[..pos], &raw[pos + 4..])
    } else if let Some(pos) = raw.find("\n\n") {
        (&raw[..pos], &raw[pos + 2..])
    } else {
        (raw, "")
    }
}

/// Random `z9hG4bK`-prefixed Via branch (RFC 3261 §8.1.1.7).
pub fn new_branch() -> String {
    format!("z9hG4bK_{}", rand::random::<u32>())
}

/// Random tag for `From`/`To`.
pub fn new_tag() -> String {
    rand::random::<u32>().to_string()
}

/// Random Call-ID, unique per request.
pub fn new_call_id() -> String {
    rand::random::<u64>().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_request_with_body() {
        let raw = "INVITE sip:34020000001320000001@3402000000 SIP/2.0\r\n\
                   Call-ID: 42\r\n\
                   CSeq: 1 INVITE\r\n\
                   Content-Length: 5\r\n\r\n\
                   v=0\r\n";
        let msg = SipMessage::parse(raw).unwrap();
        let SipMessage::Request(req) = msg else {
            panic!("expected request");
        };
        assert_eq!(req.method, Method::Invite);
        assert_eq!(req.call_id(), Some("42"));
        assert_eq!(req.body, "v=0\r\n");
    }

    #[test]
    fn parse_response() {
        let raw = "SIP/2.0 200 OK\r\nCall-ID: 42\r\nCSeq: 101 REGISTER\r\n\r\n";
        let msg = SipMessage::parse(raw).unwrap();
        let SipMessage::Response(res) = msg else {
            panic!("expected response");
        };
        assert_eq!(res.status_code, 200);
        assert_eq!(res.reason, "OK");
        assert_eq!(res.cseq(), Some((101, Method::Register)));
    }

    #[test]
    fn parse_skips_leading_blank_lines() {
        let raw = "\r\n\r\nSIP/2.0 100 Trying\r\nCall-ID: 1\r\n\r\n";
        assert!(matches!(SipMessage::parse(raw), Ok(SipMessage::Response(_))));
    }

    #[test]
    fn parse_empty_is_error() {
        assert!(SipMessage::parse("").is_err());
    }

    #[test]
    fn method_roundtrip_unknown() {
        let m: Method = "SUBSCRIBE".parse().unwrap();
        assert_eq!(m, Method::Extension("SUBSCRIBE".to_string()));
        assert_eq!(m.to_string(), "SUBSCRIBE");
    }
}
