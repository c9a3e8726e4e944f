use crate::error::{GbError, ParseErrorKind, Result};

use super::{Headers, Method, SIP_VERSION, SipRequest};

/// Headers a response copies from the request it answers (RFC 3261 §8.2.6.2).
const ECHOED_HEADERS: [&str; 5] = ["Via", "From", "To", "Call-ID", "CSeq"];

/// A SIP response (RFC 3261 §7.2).
///
/// ```text
/// SIP/2.0 200 OK\r\n
/// Via: SIP/2.0/TCP 10.0.0.1:5060;branch=z9hG4bK776\r\n
/// Call-ID: 8812\r\n
/// CSeq: 1 INVITE\r\n
/// Content-Length: 0\r\n
/// \r\n
/// ```
#[derive(Debug, Clone)]
#[must_use]
pub struct SipResponse {
    pub status_code: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: String,
}

impl SipResponse {
    pub fn new(status_code: u16, reason: &str) -> Self {
        SipResponse {
            status_code,
            reason: reason.to_string(),
            headers: Headers::new(),
            body: String::new(),
        }
    }

    /// A response to `req` carrying its Via, From, To, Call-ID and CSeq.
    pub fn from_request(req: &SipRequest, status_code: u16, reason: &str) -> Self {
        let mut res = Self::new(status_code, reason);
        for name in ECHOED_HEADERS {
            for value in req.headers.get_all(name) {
                res.headers.push(name, value);
            }
        }
        res
    }

    pub(crate) fn from_parts(start: &str, headers: Headers, body: String) -> Result<Self> {
        let mut parts = start.splitn(3, ' ');
        let invalid = || GbError::Parse {
            kind: ParseErrorKind::InvalidStartLine,
        };

        let version = parts.next().ok_or_else(invalid)?;
        if version != SIP_VERSION {
            return Err(invalid());
        }
        let status_code = parts
            .next()
            .and_then(|c| c.parse().ok())
            .ok_or_else(invalid)?;
        let reason = parts.next().unwrap_or("").trim().to_string();

        Ok(SipResponse {
            status_code,
            reason,
            headers,
            body,
        })
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push(name, value);
        self
    }

    pub fn with_body(mut self, content_type: &str, body: String) -> Self {
        self.headers.set("Content-Type", content_type);
        self.body = body;
        self
    }

    /// 1xx.
    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status_code)
    }

    /// 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.call_id()
    }

    pub fn cseq(&self) -> Option<(u32, Method)> {
        self.headers.cseq()
    }

    pub fn message_id(&self) -> String {
        format!("{}/{}", self.status_code, self.call_id().unwrap_or("-"))
    }

    pub fn serialize(&self) -> String {
        let mut out = format!("{} {} {}\r\n", SIP_VERSION, self.status_code, self.reason);
        self.headers.write_to(&mut out);
        out.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        out.push_str(&self.body);
        out
    }
}
