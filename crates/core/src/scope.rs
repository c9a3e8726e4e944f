//! Hierarchical cancellation scopes.
//!
//! A [`Scope`] bounds how long blocking work may run. It ends when it is
//! cancelled, when its deadline passes, or when its parent ends, whichever
//! comes first. Children never outlive their parent:
//!
//! ```text
//! run scope (overall deadline)
//!  ├── session scope (cancelled by close)
//!  │    └── heartbeat scope
//!  └── step scope (register / invite timeout)
//! ```
//!
//! Blocking waits select on the scope's [`done`](Scope::done) channel, which
//! disconnects when the scope is cancelled, and on its deadline timer.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Select, Sender, after, at, bounded, never, select};
use parking_lot::Mutex;

use crate::error::{GbError, Result};

/// Why a scope ended.
#[derive(Debug, Clone)]
enum Cause {
    Cancelled,
    DeadlineExceeded,
    Aborted(String),
}

impl Cause {
    fn to_error(&self) -> GbError {
        match self {
            Cause::Cancelled => GbError::Cancelled,
            Cause::DeadlineExceeded => GbError::DeadlineExceeded,
            Cause::Aborted(reason) => GbError::Transport(reason.clone()),
        }
    }
}

struct State {
    cause: Option<Cause>,
    /// Dropped on cancellation; disconnects `done_rx`.
    done_tx: Option<Sender<()>>,
    children: Vec<Weak<Inner>>,
}

struct Inner {
    deadline: Option<Instant>,
    done_rx: Receiver<()>,
    state: Mutex<State>,
}

impl Inner {
    fn end(&self, cause: Cause) {
        let children = {
            let mut state = self.state.lock();
            if state.cause.is_some() {
                return;
            }
            state.cause = Some(cause.clone());
            state.done_tx = None;
            std::mem::take(&mut state.children)
        };
        for child in children.iter().filter_map(Weak::upgrade) {
            child.end(cause.clone());
        }
    }
}

/// A cancellable, optionally deadline-bounded scope. Cheap to clone; clones
/// share the same cancellation state.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("deadline", &self.inner.deadline)
            .field("cause", &self.inner.state.lock().cause)
            .finish()
    }
}

impl Scope {
    /// A root scope that ends only when cancelled.
    pub fn background() -> Self {
        Self::with_parts(None, None)
    }

    /// A root scope that ends after `timeout`.
    pub fn timeout(timeout: Duration) -> Self {
        Self::with_parts(None, Some(Instant::now() + timeout))
    }

    fn with_parts(parent: Option<&Scope>, deadline: Option<Instant>) -> Self {
        let (done_tx, done_rx) = bounded(0);
        let deadline = match (parent.and_then(|p| p.inner.deadline), deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let scope = Scope {
            inner: Arc::new(Inner {
                deadline,
                done_rx,
                state: Mutex::new(State {
                    cause: None,
                    done_tx: Some(done_tx),
                    children: Vec::new(),
                }),
            }),
        };

        if let Some(parent) = parent {
            let inherited = {
                let mut state = parent.inner.state.lock();
                match &state.cause {
                    Some(cause) => Some(cause.clone()),
                    None => {
                        state.children.retain(|c| c.strong_count() > 0);
                        state.children.push(Arc::downgrade(&scope.inner));
                        None
                    }
                }
            };
            if let Some(cause) = inherited {
                scope.inner.end(cause);
            }
        }
        scope
    }

    /// A child that ends when `self` does or when cancelled on its own.
    pub fn child(&self) -> Scope {
        Self::with_parts(Some(self), None)
    }

    /// A child that additionally ends after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Scope {
        Self::with_parts(Some(self), Some(Instant::now() + timeout))
    }

    /// Cancel this scope and every descendant. Idempotent.
    pub fn cancel(&self) {
        self.inner.end(Cause::Cancelled);
    }

    /// End this scope and its descendants because the underlying connection
    /// failed. Waiters observe a [`GbError::Transport`] carrying `reason`.
    pub fn abort(&self, reason: impl Into<String>) {
        self.inner.end(Cause::Aborted(reason.into()));
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// The reason this scope ended, or `None` while it is still live.
    pub fn err(&self) -> Option<GbError> {
        let mut state = self.inner.state.lock();
        if state.cause.is_none() {
            match self.inner.deadline {
                Some(deadline) if Instant::now() >= deadline => {}
                _ => return None,
            }
            drop(state);
            self.inner.end(Cause::DeadlineExceeded);
            state = self.inner.state.lock();
        }
        state.cause.as_ref().map(Cause::to_error)
    }

    /// `Ok(())` while live, the ending reason otherwise.
    pub fn check(&self) -> Result<()> {
        match self.err() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Disconnects once the scope is cancelled. Deadline expiry is observed
    /// through [`deadline_timer`](Self::deadline_timer).
    pub fn done(&self) -> &Receiver<()> {
        &self.inner.done_rx
    }

    /// Fires at the deadline; never fires for scopes without one.
    pub fn deadline_timer(&self) -> Receiver<Instant> {
        match self.inner.deadline {
            Some(deadline) => at(deadline),
            None => never(),
        }
    }

    fn ended(&self) -> GbError {
        self.err().unwrap_or(GbError::Cancelled)
    }

    /// Sleep for `d` unless the scope ends first.
    pub fn sleep(&self, d: Duration) -> Result<()> {
        self.check()?;
        let timer = self.deadline_timer();
        select! {
            recv(after(d)) -> _ => Ok(()),
            recv(self.done()) -> _ => Err(self.ended()),
            recv(timer) -> _ => Err(self.ended()),
        }
    }

    /// Block until the scope ends and return why.
    pub fn wait(&self) -> GbError {
        let timer = self.deadline_timer();
        select! {
            recv(self.done()) -> _ => {},
            recv(timer) -> _ => {},
        }
        self.ended()
    }
}

/// Receive from `rx` unless one of `scopes` ends first.
///
/// The returned error is the ending reason of whichever scope fired. A
/// disconnected `rx` is reported as a transport error.
pub fn recv_within<T>(rx: &Receiver<T>, scopes: &[&Scope]) -> Result<T> {
    for scope in scopes {
        scope.check()?;
    }

    let timers: Vec<Receiver<Instant>> = scopes.iter().map(|s| s.deadline_timer()).collect();

    let mut sel = Select::new();
    let data = sel.recv(rx);
    for (scope, timer) in scopes.iter().zip(&timers) {
        sel.recv(scope.done());
        sel.recv(timer);
    }

    let oper = sel.select();
    let index = oper.index();
    if index == data {
        return oper
            .recv(rx)
            .map_err(|_| GbError::Transport("channel closed".to_string()));
    }

    let slot = index - 1;
    let scope = scopes[slot / 2];
    if slot % 2 == 0 {
        let _ = oper.recv(scope.done());
    } else {
        let _ = oper.recv(&timers[slot / 2]);
    }
    Err(scope.ended())
}

/// Send `msg` on a bounded queue, waiting for room unless `scope` ends.
///
/// Returns `false` when the message was dropped because the scope ended or
/// the receiving side is gone.
pub fn send_within<T>(tx: &Sender<T>, msg: T, scope: &Scope) -> bool {
    let timer = scope.deadline_timer();
    select! {
        send(tx, msg) -> res => res.is_ok(),
        recv(scope.done()) -> _ => false,
        recv(timer) -> _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::thread;

    #[test]
    fn cancel_propagates_to_children() {
        let root = Scope::background();
        let child = root.child();
        let grandchild = child.with_timeout(Duration::from_secs(60));
        assert!(grandchild.err().is_none());

        root.cancel();
        assert!(matches!(child.err(), Some(GbError::Cancelled)));
        assert!(matches!(grandchild.err(), Some(GbError::Cancelled)));
    }

    #[test]
    fn child_cancel_leaves_parent_live() {
        let root = Scope::background();
        let child = root.child();
        child.cancel();
        assert!(child.is_done());
        assert!(!root.is_done());
    }

    #[test]
    fn child_of_ended_scope_is_ended() {
        let root = Scope::background();
        root.cancel();
        assert!(root.child().is_done());
    }

    #[test]
    fn child_deadline_is_bounded_by_parent() {
        let root = Scope::timeout(Duration::from_millis(10));
        let child = root.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), root.deadline());
    }

    #[test]
    fn deadline_reports_exceeded() {
        let scope = Scope::timeout(Duration::from_millis(20));
        let err = scope.sleep(Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, GbError::DeadlineExceeded));
        assert!(matches!(scope.err(), Some(GbError::DeadlineExceeded)));
    }

    #[test]
    fn sleep_returns_promptly_on_cancel() {
        let scope = Scope::background();
        let s = scope.clone();
        let start = Instant::now();
        let h = thread::spawn(move || s.sleep(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(20));
        scope.cancel();
        let res = h.join().unwrap();
        assert!(matches!(res, Err(GbError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn abort_surfaces_transport_error() {
        let root = Scope::background();
        let child = root.child();
        root.abort("connection reset");
        assert!(matches!(child.err(), Some(GbError::Transport(r)) if r == "connection reset"));
    }

    #[test]
    fn recv_within_prefers_data() {
        let (tx, rx) = unbounded();
        tx.send(7u32).unwrap();
        let scope = Scope::background();
        assert_eq!(recv_within(&rx, &[&scope]).unwrap(), 7);
    }

    #[test]
    fn recv_within_reports_which_scope_ended() {
        let (_tx, rx) = unbounded::<u32>();
        let session = Scope::background();
        let step = Scope::timeout(Duration::from_millis(20));
        let err = recv_within(&rx, &[&step, &session]).unwrap_err();
        assert!(matches!(err, GbError::DeadlineExceeded));

        let session = Scope::background();
        session.cancel();
        let step = Scope::timeout(Duration::from_secs(5));
        let err = recv_within(&rx, &[&step, &session]).unwrap_err();
        assert!(matches!(err, GbError::Cancelled));
    }

    #[test]
    fn send_within_drops_when_full_and_cancelled() {
        let (tx, _rx) = bounded(1);
        let scope = Scope::background();
        assert!(send_within(&tx, 1u8, &scope));
        scope.cancel();
        assert!(!send_within(&tx, 2u8, &scope));
    }
}
