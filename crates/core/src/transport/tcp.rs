use std::io::{self, BufRead};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::{GbError, ParseErrorKind, Result};
use crate::protocol::SipMessage;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest body a peer may announce before the connection is treated as
/// corrupt. GB28181 bodies are short SDP or MANSCDP XML documents.
const MAX_BODY: usize = 64 * 1024;

/// A `scheme://host:port` signaling or media address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn parse(addr: &str) -> Result<Self> {
        let invalid = |reason| GbError::InvalidAddress {
            addr: addr.to_string(),
            reason,
        };

        let (scheme, rest) = addr.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        let authority = rest.split('/').next().unwrap_or("");
        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = port.parse().map_err(|_| invalid("invalid port"))?;

        Ok(Endpoint {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_string(),
            port,
        })
    }

    /// First socket address `host:port` resolves to.
    pub fn resolve(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|source| GbError::Connect {
                addr: self.to_string(),
                source,
            })?
            .next()
            .ok_or_else(|| GbError::InvalidAddress {
                addr: self.to_string(),
                reason: "host did not resolve",
            })
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Connect to a `tcp://` (or `tcp4://`) signaling address.
pub fn connect(addr: &str) -> Result<TcpStream> {
    let endpoint = Endpoint::parse(addr)?;
    if endpoint.scheme != "tcp" && endpoint.scheme != "tcp4" {
        return Err(GbError::InvalidAddress {
            addr: addr.to_string(),
            reason: "scheme must be tcp",
        });
    }

    let sock_addr = endpoint.resolve()?;
    let stream = TcpStream::connect_timeout(&sock_addr, CONNECT_TIMEOUT).map_err(|source| {
        GbError::Connect {
            addr: addr.to_string(),
            source,
        }
    })?;
    stream.set_nodelay(true)?;

    tracing::debug!(%sock_addr, "signaling connected");
    Ok(stream)
}

/// Read one SIP message from a stream.
///
/// A message is a header block terminated by an empty line, followed by
/// exactly `Content-Length` body bytes. Blank keep-alive lines between
/// messages are skipped. Returns `Ok(None)` on a clean end of stream.
pub fn read_message(reader: &mut impl BufRead) -> Result<Option<SipMessage>> {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return if head.is_empty() {
                Ok(None)
            } else {
                Err(GbError::Transport("connection closed mid-message".to_string()))
            };
        }

        if line == "\r\n" || line == "\n" {
            if head.is_empty() {
                continue;
            }
            break;
        }
        head.push_str(&line);
    }

    // Without a usable length the next message boundary is unknown.
    let content_length = match content_length(&head) {
        Some(Ok(n)) => n,
        Some(Err(value)) => {
            return Err(GbError::Transport(format!("invalid Content-Length {value:?}")));
        }
        None => 0,
    };
    if content_length > MAX_BODY {
        io::copy(
            &mut io::Read::take(&mut *reader, content_length as u64),
            &mut io::sink(),
        )?;
        return Err(GbError::Parse {
            kind: ParseErrorKind::InvalidContentLength,
        });
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body)?;

    head.push_str(if head.ends_with("\r\n") { "\r\n" } else { "\n" });
    head.push_str(&String::from_utf8_lossy(&body));
    SipMessage::parse(&head).map(Some)
}

fn content_length(head: &str) -> Option<std::result::Result<usize, &str>> {
    head.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        let name = name.trim();
        let value = value.trim();
        (name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("l"))
            .then(|| value.parse().map_err(|_| value))
    })
}
