//! Error types for the GB28181 device emulator.

use std::fmt;

use crate::device::DeviceState;

/// Errors that can occur while driving a emulated GB28181 device.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Transport**: [`Io`](Self::Io), [`Connect`](Self::Connect),
///   [`InvalidAddress`](Self::InvalidAddress), [`Transport`](Self::Transport).
/// - **Protocol**: [`Parse`](Self::Parse) for malformed SIP text,
///   [`Protocol`](Self::Protocol) for missing or unexpected fields,
///   [`InvalidState`](Self::InvalidState) for out-of-order signaling steps.
/// - **Timeout/cancellation**: [`Cancelled`](Self::Cancelled),
///   [`DeadlineExceeded`](Self::DeadlineExceeded).
/// - **Media**: [`EndOfStream`](Self::EndOfStream),
///   [`InvalidBitstream`](Self::InvalidBitstream).
///
/// [`Context`](Self::Context) wraps any of the above with the operation that
/// failed; use [`root`](GbError::root) to reach the underlying kind.
#[derive(Debug, thiserror::Error)]
pub enum GbError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Could not establish a connection to the peer.
    #[error("connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Address was not of the form `tcp://host:port` (or `udp://` for media).
    #[error("invalid address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: &'static str },

    /// Connection-level failure after connect: peer hangup, closed session.
    #[error("transport error: {0}")]
    Transport(String),

    /// Failed to parse a SIP message.
    #[error("SIP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// A message was well-formed but lacked a field we depend on.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A signaling step was attempted from a state that does not allow it.
    #[error("cannot {op} in state {state:?}")]
    InvalidState { op: &'static str, state: DeviceState },

    /// The governing scope was cancelled.
    #[error("context canceled")]
    Cancelled,

    /// The governing scope's deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// A media source ran out of data.
    #[error("end of stream")]
    EndOfStream,

    /// Media input is not a valid Annex-B or ADTS stream.
    #[error("invalid bitstream: {0}")]
    InvalidBitstream(String),

    /// Invalid or unusable configuration, e.g. a media file that cannot be
    /// opened or a zero frame rate.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A user-supplied hook rejected the step.
    #[error("callback: {0}")]
    Callback(String),

    /// An error annotated with the operation that produced it.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<GbError>,
    },
}

/// Specific kind of SIP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no start line).
    EmptyMessage,
    /// Start line was neither `Method URI SIP/2.0` nor `SIP/2.0 Code Reason`.
    InvalidStartLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` was present but not a number.
    InvalidContentLength,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "empty message"),
            Self::InvalidStartLine => write!(f, "invalid start line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid Content-Length"),
        }
    }
}

impl GbError {
    /// Wrap `self` with a description of the failing operation.
    pub fn wrap(self, context: impl Into<String>) -> Self {
        GbError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping every [`Context`](Self::Context) layer.
    pub fn root(&self) -> &GbError {
        let mut err = self;
        while let GbError::Context { source, .. } = err {
            err = source;
        }
        err
    }

    /// Whether this is the timeout/cancellation kind.
    pub fn is_cancellation(&self) -> bool {
        matches!(self.root(), GbError::Cancelled | GbError::DeadlineExceeded)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), GbError::Cancelled)
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self.root(), GbError::DeadlineExceeded)
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self.root(), GbError::EndOfStream)
    }
}

/// Adds `context` to results, mirroring [`GbError::wrap`].
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.wrap(context))
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.wrap(f()))
    }
}

/// Reduce the outcomes of a run to a single terminal error.
///
/// Errors whose root is [`GbError::Cancelled`] come from an intentional,
/// caller-driven stop and are dropped. If one error remains it is returned
/// unchanged; if several remain the first is returned with the others folded
/// into its context.
pub fn filter_errors<I>(results: I) -> Result<()>
where
    I: IntoIterator<Item = Result<()>>,
{
    let mut kept: Vec<GbError> = results
        .into_iter()
        .filter_map(|r| r.err())
        .filter(|e| !e.is_cancelled())
        .collect();

    if kept.is_empty() {
        return Ok(());
    }

    let first = kept.remove(0);
    if kept.is_empty() {
        return Err(first);
    }

    let rest: Vec<String> = kept
        .iter()
        .enumerate()
        .map(|(i, e)| format!("err #{i}, {e}"))
        .collect();
    Err(first.wrap(format!("with {}", rest.join(","))))
}

/// Convenience alias for `Result<T, GbError>`.
pub type Result<T> = std::result::Result<T, GbError>;
