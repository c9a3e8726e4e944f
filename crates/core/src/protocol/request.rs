use crate::error::{GbError, ParseErrorKind, Result};

use super::{Headers, Method, SIP_VERSION, new_branch, new_call_id, new_tag};

/// Address the device advertises in `Via` and `Contact`.
pub const LOCAL_CONTACT: &str = "192.168.3.99:5060";

/// Value of `Max-Forwards` on every request this device originates.
pub const MAX_FORWARDS: u32 = 70;

/// A SIP request (RFC 3261 §7.1).
///
/// ```text
/// Method SP Request-URI SP SIP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// Chain [`add_header`](Self::add_header) and [`with_body`](Self::with_body),
/// then call [`serialize`](Self::serialize). `Content-Length` is always
/// written from the actual body length.
#[derive(Debug, Clone)]
#[must_use]
pub struct SipRequest {
    pub method: Method,
    /// Request-URI (e.g. `sip:34020000002000000001@3402000000`).
    pub uri: String,
    pub version: String,
    pub headers: Headers,
    pub body: String,
}

impl SipRequest {
    pub fn new(method: Method, uri: &str) -> Self {
        SipRequest {
            method,
            uri: uri.to_string(),
            version: SIP_VERSION.to_string(),
            headers: Headers::new(),
            body: String::new(),
        }
    }

    /// Build from an already split request line, header block and body.
    pub(crate) fn from_parts(start: &str, headers: Headers, body: String) -> Result<Self> {
        let parts: Vec<&str> = start.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(GbError::Parse {
                kind: ParseErrorKind::InvalidStartLine,
            });
        }

        let version = parts[2].to_string();
        if version != SIP_VERSION {
            tracing::warn!(version, "peer sent non-SIP/2.0 request");
        }

        let method = match parts[0].parse() {
            Ok(m) => m,
            Err(never) => match never {},
        };

        Ok(SipRequest {
            method,
            uri: parts[1].to_string(),
            version,
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

    pub fn call_id(&self) -> Option<&str> {
        self.headers.call_id()
    }

    pub fn cseq(&self) -> Option<(u32, Method)> {
        self.headers.cseq()
    }

    pub fn is_ack(&self) -> bool {
        self.method == Method::Ack
    }

    pub fn message_id(&self) -> String {
        format!("{}/{}", self.method, self.call_id().unwrap_or("-"))
    }

    pub fn serialize(&self) -> String {
        let mut out = format!("{} {} {}\r\n", self.method, self.uri, self.version);
        self.headers.write_to(&mut out);
        out.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        out.push_str(&self.body);
        out
    }
}

/// Builds the requests a device originates: REGISTER, MESSAGE and BYE.
///
/// Every request gets a TCP `Via` with a fresh branch, a tagged `From`, a
/// `To` (the device for REGISTER, the platform otherwise), a fresh random
/// `Call-ID`, the caller's `CSeq`, a `Contact` at [`LOCAL_CONTACT`] and
/// `Max-Forwards: 70`.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    method: Method,
    device_id: String,
    domain: String,
    server: String,
    cseq: u32,
    call_id: Option<String>,
    expires: Option<u32>,
    body: Option<(String, String)>,
}

impl RequestBuilder {
    pub fn new(method: Method, device_id: &str, domain: &str, server: &str) -> Self {
        RequestBuilder {
            method,
            device_id: device_id.to_string(),
            domain: domain.to_string(),
            server: server.to_string(),
            cseq: 1,
            call_id: Some(new_call_id()),
            expires: None,
            body: None,
        }
    }

    pub fn cseq(mut self, cseq: u32) -> Self {
        self.cseq = cseq;
        self
    }

    /// Override the generated Call-ID. `None` leaves the request without one,
    /// which [`build`](Self::build) rejects.
    pub fn call_id(mut self, call_id: Option<String>) -> Self {
        self.call_id = call_id;
        self
    }

    pub fn expires(mut self, seconds: u32) -> Self {
        self.expires = Some(seconds);
        self
    }

    pub fn body(mut self, content_type: &str, body: String) -> Self {
        self.body = Some((content_type.to_string(), body));
        self
    }

    pub fn build(self) -> Result<SipRequest> {
        let call_id = self
            .call_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| GbError::Protocol(format!("{} request without Call-ID", self.method)))?;

        let device_uri = format!("sip:{}@{}", self.device_id, self.domain);
        let uri = format!("sip:{}@{}", self.server, self.domain);
        // REGISTER addresses the device's own record; everything else the platform.
        let to_uri = match self.method {
            Method::Register => &device_uri,
            _ => &uri,
        };

        let mut req = SipRequest::new(self.method.clone(), &uri)
            .add_header(
                "Via",
                &format!("SIP/2.0/TCP {LOCAL_CONTACT};rport;branch={}", new_branch()),
            )
            .add_header("From", &format!("<{device_uri}>;tag={}", new_tag()))
            .add_header("To", &format!("<{to_uri}>"))
            .add_header("Call-ID", &call_id)
            .add_header("CSeq", &format!("{} {}", self.cseq, self.method))
            .add_header(
                "Contact",
                &format!("<sip:{}@{LOCAL_CONTACT}>", self.device_id),
            )
            .add_header("Max-Forwards", &MAX_FORWARDS.to_string());

        if let Some(expires) = self.expires {
            req = req.add_header("Expires", &expires.to_string());
        }
        if let Some((content_type, body)) = self.body {
            req = req.with_body(&content_type, body);
        }
        Ok(req)
    }
}
