//! Error types for the Tether core runtime.

use crate::ident::{ContextId, Identifier, Kind, RequestId, ServiceId, StreamId};
use crate::message::RemoteFailure;
use thiserror::Error;

/// Identifier allocation errors
#[derive(Debug, Error)]
pub enum IdentError {
    /// The value space for a kind is exhausted; fatal to the requesting
    /// operation, not to the session
    #[error("identifier space exhausted for kind {kind}")]
    Exhausted {
        /// The kind whose space ran out
        kind: Kind,
    },

    /// An untyped identifier was wrapped as the wrong kind
    #[error("identifier kind mismatch: expected {expected}, got {actual}")]
    KindMismatch {
        /// Kind the wrapper requires
        expected: Kind,
        /// Kind actually carried
        actual: Kind,
    },
}

/// Transport-level errors surfaced through handler operations.
///
/// A transmission failure is scoped to the failing operation; it does not
/// implicitly close the session.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error from the underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport is closed
    #[error("transport is closed")]
    Closed,

    /// Connection to the remote endpoint failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// No registered factory accepts the given URI
    #[error("unsupported scheme in URI: {0}")]
    UnsupportedScheme(String),

    /// Invalid transport configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transport-specific error
    #[error("transport error: {0}")]
    Other(String),
}

/// Session-level errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session has been closed
    #[error("session is closed")]
    Closed,

    /// No protocol handler is bound to this session yet
    #[error("no protocol handler bound")]
    HandlerUnbound,

    /// A handler is already bound to this session
    #[error("a protocol handler is already bound")]
    AlreadyBound,

    /// Unknown service identifier
    #[error("unknown service {0}")]
    UnknownService(ServiceId),

    /// Unknown context identifier
    #[error("unknown context {0}")]
    UnknownContext(ContextId),

    /// Unknown request identifier
    #[error("unknown request {0}")]
    UnknownRequest(RequestId),

    /// Unknown stream identifier
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    /// The context is closing or closed and accepts no new work
    #[error("context {0} is closed")]
    ContextClosed(ContextId),

    /// A terminal response was already sent for this request
    #[error("request {0} already completed")]
    AlreadyCompleted(RequestId),

    /// The service has no listener attached to dispatch requests to
    #[error("service {0} has no listener")]
    NoListener(ServiceId),
}

/// Protocol-level conditions observed on inbound traffic.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Stray, duplicate, or unknown-identifier message; logged and dropped,
    /// session continues
    #[error("protocol anomaly: {0}")]
    Anomaly(String),

    /// Undecodable frame or structurally invalid traffic; fatal to the
    /// session, triggers the forced close cascade
    #[error("structural corruption: {0}")]
    Corrupt(String),
}

/// Top-level core error
#[derive(Debug, Error)]
pub enum Error {
    /// Identifier allocation failure
    #[error(transparent)]
    Ident(#[from] IdentError),

    /// Transport failure scoped to one operation
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Session state failure
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Protocol-level failure
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Marshalling failure
    #[error(transparent)]
    Marshal(#[from] tether_marshal::MarshalError),
}

/// Outcome-facing error for `invoke` and pending replies.
///
/// A remote execution failure is always distinguished from a local
/// transport failure.
#[derive(Debug, Error)]
pub enum InvocationError {
    /// The remote request listener raised an application-level error
    #[error("remote execution failed: {0}")]
    Remote(RemoteFailure),

    /// The request was cancelled before a reply arrived
    #[error("request cancelled")]
    Cancelled,

    /// The session closed before the request reached a terminal state
    #[error("session closed before completion")]
    Closed,

    /// A local failure (allocation, transport, session state)
    #[error(transparent)]
    Local(#[from] Error),
}

impl InvocationError {
    /// True if the failure happened on the remote side.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

/// Convenience for anomaly logging sites.
pub(crate) fn anomaly(what: &str, id: Identifier) {
    tracing::warn!(%id, "protocol anomaly: {what}; message dropped");
}
