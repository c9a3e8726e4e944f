//! Owns the signaling connection and routes inbound traffic.
//!
//! ```text
//!                       ┌──► requests (bounded 1024) ──► wait_request(method)
//! TcpStream ──► reader ─┤
//!                       └──► waiters[Call-ID] ──────────► ResponseWaiter::wait
//! ```
//!
//! Requests the platform initiates (INVITE, ACK) land in a single queue
//! and are picked by method. Responses are matched by Call-ID to the
//! waiter registered for it; a response nobody waits for is dropped.

use std::collections::HashMap;
use std::io::{BufReader, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;

use crate::error::{GbError, Result};
use crate::protocol::{Method, SipMessage, SipRequest, SipResponse};
use crate::scope::{Scope, recv_within, send_within};
use crate::transport::tcp;

/// Capacity of every inbound queue.
pub const QUEUE_CAPACITY: usize = 1024;

/// How long [`Correlator::close`] waits for the reader thread.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

type Waiters = Arc<Mutex<HashMap<String, Sender<SipResponse>>>>;

/// One signaling connection with its reader thread.
pub struct Correlator {
    addr: String,
    stream: TcpStream,
    writer: Mutex<TcpStream>,
    scope: Scope,
    requests: Receiver<SipRequest>,
    waiters: Waiters,
    reader: Mutex<Option<JoinHandle<()>>>,
    reader_exited: Receiver<()>,
}

impl Correlator {
    /// Connect to `addr` and start the reader thread. The connection lives
    /// until [`close`](Self::close) or until `parent` ends.
    pub fn connect(addr: &str, parent: &Scope) -> Result<Self> {
        parent.check()?;
        let stream = tcp::connect(addr)?;
        let writer = stream.try_clone()?;
        let reader = BufReader::new(stream.try_clone()?);

        let scope = parent.child();
        let (req_tx, req_rx) = bounded(QUEUE_CAPACITY);
        let (exit_tx, exit_rx) = bounded::<()>(1);
        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));

        let handle = {
            let scope = scope.clone();
            let waiters = waiters.clone();
            thread::Builder::new()
                .name("sip-reader".to_string())
                .spawn(move || {
                    let _exit = exit_tx;
                    dispatch(reader, scope, req_tx, waiters);
                })?
        };

        tracing::info!(addr, "signaling connection established");
        Ok(Correlator {
            addr: addr.to_string(),
            stream,
            writer: Mutex::new(writer),
            scope,
            requests: req_rx,
            waiters,
            reader: Mutex::new(Some(handle)),
            reader_exited: exit_rx,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Scope of the connection. Ends on close or when the peer hangs up.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Serialize and write `msg`.
    pub fn send(&self, msg: impl Into<SipMessage>) -> Result<()> {
        let msg = msg.into();
        self.scope.check()?;
        let text = msg.serialize();
        tracing::debug!(id = %msg.message_id(), bytes = text.len(), "send");
        tracing::trace!("{text}");
        self.writer
            .lock()
            .write_all(text.as_bytes())
            .map_err(|e| GbError::from(e).wrap(format!("send {}", msg.message_id())))
    }

    /// Start collecting responses carrying `call_id`. Register before
    /// sending the request so a fast answer is not lost.
    pub fn expect(&self, call_id: &str) -> ResponseWaiter<'_> {
        let (tx, rx) = bounded(QUEUE_CAPACITY);
        if self.waiters.lock().insert(call_id.to_string(), tx).is_some() {
            tracing::warn!(call_id, "replaced existing response waiter");
        }
        ResponseWaiter {
            correlator: self,
            call_id: call_id.to_string(),
            rx,
        }
    }

    /// Send `req` and wait for its final response.
    pub fn request(&self, req: SipRequest, scope: &Scope) -> Result<SipResponse> {
        let call_id = req
            .call_id()
            .ok_or_else(|| GbError::Protocol(format!("{} request without Call-ID", req.method)))?
            .to_string();
        let waiter = self.expect(&call_id);
        self.send(req)?;
        waiter.wait(scope)
    }

    /// Wait for a response with `call_id`. Only responses arriving after
    /// this call are seen; see [`expect`](Self::expect).
    pub fn wait_response(&self, call_id: &str, scope: &Scope) -> Result<SipResponse> {
        self.expect(call_id).wait(scope)
    }

    /// Wait for an inbound request of `method`. Other requests taken off the
    /// queue meanwhile are dropped.
    pub fn wait_request(&self, method: &Method, scope: &Scope) -> Result<SipRequest> {
        loop {
            let req = self.next_request(scope)?;
            if req.method == *method {
                return Ok(req);
            }
            tracing::warn!(want = %method, id = %req.message_id(), "drop request");
        }
    }

    /// Next inbound request of any method.
    pub fn next_request(&self, scope: &Scope) -> Result<SipRequest> {
        recv_within(&self.requests, &[scope, &self.scope])
    }

    /// Stop the reader thread and close the connection. Gives the thread
    /// [`CLEANUP_TIMEOUT`] to exit and then carries on regardless.
    pub fn close(&self) {
        self.scope.cancel();
        let _ = self.stream.shutdown(Shutdown::Both);

        let Some(handle) = self.reader.lock().take() else {
            return;
        };
        match self.reader_exited.recv_timeout(CLEANUP_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
                tracing::debug!(addr = %self.addr, "signaling connection closed");
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::error!(addr = %self.addr, "timed out waiting for SIP reader to exit");
            }
        }
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.close();
    }
}

/// Responses for one Call-ID. Unregisters on drop.
pub struct ResponseWaiter<'a> {
    correlator: &'a Correlator,
    call_id: String,
    rx: Receiver<SipResponse>,
}

impl ResponseWaiter<'_> {
    /// The next final response. Provisional (1xx) responses are skipped.
    pub fn wait(&self, scope: &Scope) -> Result<SipResponse> {
        loop {
            let res = recv_within(&self.rx, &[scope, &self.correlator.scope])?;
            if res.is_provisional() {
                tracing::debug!(id = %res.message_id(), "provisional response");
                continue;
            }
            return Ok(res);
        }
    }
}

impl Drop for ResponseWaiter<'_> {
    fn drop(&mut self) {
        self.correlator.waiters.lock().remove(&self.call_id);
    }
}

fn dispatch(
    mut reader: BufReader<TcpStream>,
    scope: Scope,
    requests: Sender<SipRequest>,
    waiters: Waiters,
) {
    loop {
        let msg = match tcp::read_message(&mut reader) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                if !scope.is_done() {
                    tracing::info!("signaling connection closed by peer");
                    scope.abort("connection closed by peer");
                }
                break;
            }
            Err(e @ GbError::Parse { .. }) => {
                tracing::warn!(error = %e, "drop unparsable message");
                continue;
            }
            Err(e) => {
                if !scope.is_done() {
                    tracing::warn!(error = %e, "signaling read failed");
                    scope.abort(format!("read: {e}"));
                }
                break;
            }
        };

        tracing::debug!(id = %msg.message_id(), "recv");
        match msg {
            SipMessage::Request(req) => {
                let id = req.message_id();
                if !send_within(&requests, req, &scope) {
                    tracing::warn!(%id, "drop request, session closing");
                    break;
                }
            }
            SipMessage::Response(res) => {
                let waiter = res
                    .call_id()
                    .and_then(|call_id| waiters.lock().get(call_id).cloned());
                match waiter {
                    Some(tx) => {
                        // A waiter that went away between lookup and send is fine.
                        let id = res.message_id();
                        if !send_within(&tx, res, &scope) && scope.is_done() {
                            tracing::warn!(%id, "drop response, session closing");
                            break;
                        }
                    }
                    None => {
                        tracing::warn!(id = %res.message_id(), "drop response, no waiter");
                    }
                }
            }
        }
    }
    tracing::debug!("SIP reader exited");
}
