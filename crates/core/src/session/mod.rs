//! SIP dialog operations of one emulated device (GB28181 §9.1, §9.2, §9.6).
//!
//! A [`SipSession`] owns the [`Correlator`] for its signaling connection and
//! the CSeq counter. Each operation builds a request, sends it and waits
//! for the response carrying the same Call-ID:
//!
//! ```text
//! device                          platform
//!   │ REGISTER (Expires: 3600) ──────►│
//!   │◄─────────────────────── 200 OK  │
//!   │◄─────────────────────── INVITE  │  (SDP offer: m=video, y=)
//!   │ 100 Trying ────────────────────►│
//!   │ 200 OK ────────────────────────►│
//!   │◄─────────────────────── ACK     │
//!   │ MESSAGE (Keepalive) ───────────►│  every heartbeat interval
//!   │◄─────────────────────── 200 OK  │
//!   │ BYE / REGISTER (Expires: 0) ───►│
//! ```
//!
//! The CSeq counter starts at 100 and is bumped before every request, so a
//! failed send never reuses a number.

pub mod config;
pub mod correlator;

use std::sync::atomic::{AtomicU32, Ordering};

pub use config::SipConfig;
pub use correlator::{Correlator, ResponseWaiter};

use crate::error::{GbError, Result, ResultExt};
use crate::protocol::request::LOCAL_CONTACT;
use crate::protocol::{Method, RequestBuilder, SipRequest, SipResponse, new_tag};
use crate::scope::Scope;

/// Initial CSeq; the first request uses 101.
const INITIAL_SEQ: u32 = 100;

/// `Expires` of REGISTER, MESSAGE and BYE.
const DEFAULT_EXPIRES: u32 = 3600;

const MANSCDP_XML: &str = "Application/MANSCDP+xml";

/// A request and the final response it got.
pub type Exchange = (SipRequest, SipResponse);

pub struct SipSession {
    config: SipConfig,
    conn: Correlator,
    seq: AtomicU32,
}

impl SipSession {
    /// Connect to `config.addr`. The session ends with `scope`.
    pub fn connect(config: SipConfig, scope: &Scope) -> Result<Self> {
        let conn = Correlator::connect(&config.addr, scope)
            .with_context(|| format!("connect with sipConfig {config}"))?;
        Ok(SipSession {
            config,
            conn,
            seq: AtomicU32::new(INITIAL_SEQ),
        })
    }

    pub fn config(&self) -> &SipConfig {
        &self.config
    }

    pub fn device_id(&self) -> &str {
        self.config.device_id()
    }

    /// Scope of the underlying connection.
    pub fn scope(&self) -> &Scope {
        self.conn.scope()
    }

    /// Bump the counter and return the new value.
    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn builder(&self, method: Method) -> RequestBuilder {
        RequestBuilder::new(
            method,
            self.config.device_id(),
            &self.config.domain,
            &self.config.server,
        )
        .cseq(self.next_seq())
    }

    /// Send `req` and wait for its final response, which must be 2xx.
    fn exchange(&self, req: SipRequest, scope: &Scope) -> Result<Exchange> {
        let id = req.message_id();
        let res = self
            .conn
            .request(req.clone(), scope)
            .with_context(|| format!("request {id}"))?;
        if !res.is_success() {
            return Err(GbError::Protocol(format!(
                "{id} rejected with {} {}",
                res.status_code, res.reason
            )));
        }
        Ok((req, res))
    }

    /// REGISTER with `Expires: 3600`.
    pub fn register(&self, scope: &Scope) -> Result<Exchange> {
        self.do_register(DEFAULT_EXPIRES, scope)
    }

    /// REGISTER with `Expires: 0`.
    pub fn unregister(&self, scope: &Scope) -> Result<Exchange> {
        self.do_register(0, scope)
    }

    fn do_register(&self, expires: u32, scope: &Scope) -> Result<Exchange> {
        scope.check()?;
        let req = self.builder(Method::Register).expires(expires).build()?;
        tracing::info!(
            call_id = req.call_id().unwrap_or_default(),
            expires,
            "send REGISTER"
        );
        self.exchange(req, scope)
    }

    /// Keepalive MESSAGE. `SN` takes its own counter value, one past CSeq.
    pub fn message(&self, scope: &Scope) -> Result<Exchange> {
        scope.check()?;
        let builder = self.builder(Method::Message).expires(DEFAULT_EXPIRES);
        let body = keepalive_body(self.next_seq(), self.config.device_id());
        let req = builder.body(MANSCDP_XML, body).build()?;
        tracing::debug!(call_id = req.call_id().unwrap_or_default(), "send MESSAGE");
        self.exchange(req, scope)
    }

    pub fn bye(&self, scope: &Scope) -> Result<Exchange> {
        scope.check()?;
        let req = self
            .builder(Method::Bye)
            .expires(DEFAULT_EXPIRES)
            .build()?;
        tracing::info!(call_id = req.call_id().unwrap_or_default(), "send BYE");
        self.exchange(req, scope)
    }

    /// Answer `invite` with `100 Trying`.
    pub fn trying(&self, scope: &Scope, invite: &SipRequest) -> Result<()> {
        scope.check()?;
        self.conn
            .send(SipResponse::from_request(invite, 100, "Trying"))
            .with_context(|| format!("trying invite {}", invite.message_id()))
    }

    /// Answer `invite` with `200 OK` and wait for the matching ACK.
    ///
    /// Any other request arriving first is a protocol error; an ACK for a
    /// different Call-ID is dropped.
    pub fn invite_response(&self, scope: &Scope, invite: &SipRequest) -> Result<SipRequest> {
        scope.check()?;
        let call_id = invite
            .call_id()
            .ok_or_else(|| GbError::Protocol(format!("INVITE without Call-ID: {}", invite.uri)))?;

        let mut res = SipResponse::from_request(invite, 200, "OK").add_header(
            "Contact",
            &format!("<sip:{}@{LOCAL_CONTACT}>", self.config.device_id()),
        );
        let tagged_to = res
            .headers
            .get("To")
            .filter(|to| !to.contains("tag="))
            .map(|to| format!("{to};tag={}", new_tag()));
        if let Some(to) = tagged_to {
            res.headers.set("To", &to);
        }
        self.conn.send(res)?;
        tracing::info!(call_id, "send INVITE response");

        loop {
            let req = self.conn.next_request(scope).context("wait ACK")?;
            if !req.is_ack() {
                return Err(GbError::Protocol(format!(
                    "invalid ACK message {}",
                    req.message_id()
                )));
            }
            if req.call_id() == Some(call_id) {
                return Ok(req);
            }
            tracing::warn!(
                want = call_id,
                got = req.call_id().unwrap_or_default(),
                "drop ACK for another call"
            );
        }
    }

    /// Wait for an inbound request of `method`.
    pub fn wait(&self, scope: &Scope, method: Method) -> Result<SipRequest> {
        self.conn.wait_request(&method, scope)
    }

    /// Close the connection and stop the reader thread.
    pub fn close(&self) {
        self.conn.close();
    }
}

fn keepalive_body(sn: u32, device_id: &str) -> String {
    [
        r#"<?xml version="1.0" encoding="GB2312"?>"#.to_string(),
        "<Notify>".to_string(),
        "<CmdType>Keepalive</CmdType>".to_string(),
        format!("<SN>{sn}</SN>"),
        format!("<DeviceID>{device_id}</DeviceID>"),
        "<Status>OK</Status>".to_string(),
        "</Notify>\n".to_string(),
    ]
    .join("\n")
}
