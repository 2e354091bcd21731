//! The transport-neutral protocol message model.
//!
//! Every wire format (in-process direct delivery, length-prefixed binary
//! frames) carries these messages; the session semantics never depend on
//! the framing. Identifiers inside a message are expressed from the
//! sender's perspective and flipped exactly once on receipt.

use crate::ident::{ContextId, RequestId, ServiceId, StreamId};
use serde::{Deserialize, Serialize};
use std::fmt;
use tether_marshal::Item;

/// Service contract metadata advertised to the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Declared request type name
    pub request_type: String,
    /// Declared reply type name
    pub reply_type: String,
    /// Optional service group
    pub group: Option<String>,
}

impl ServiceInfo {
    /// Build service metadata without a group.
    #[must_use]
    pub fn new(request_type: impl Into<String>, reply_type: impl Into<String>) -> Self {
        Self { request_type: request_type.into(), reply_type: reply_type.into(), group: None }
    }

    /// Builder-style group assignment.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// True if this contract matches the given selector fields.
    #[must_use]
    pub fn matches(&self, request_type: &str, reply_type: &str, group: Option<&str>) -> bool {
        self.request_type == request_type
            && self.reply_type == reply_type
            && self.group.as_deref() == group
    }
}

/// An application-level failure raised by a remote request listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    /// Human-readable failure description
    pub message: String,
}

impl RemoteFailure {
    /// Build a failure from a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RemoteFailure {}

/// One protocol message between two session peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    /// A service was opened locally and is being advertised
    OpenService {
        /// Identifier of the new service
        service: ServiceId,
        /// Advertised contract metadata
        info: ServiceInfo,
    },
    /// A service was closed
    CloseService {
        /// The closed service
        service: ServiceId,
    },
    /// Open a context against an advertised service
    OpenContext {
        /// Identifier of the new context
        context: ContextId,
        /// Target service
        service: ServiceId,
    },
    /// Acknowledge that a context was opened and bound
    OpenedContext {
        /// The now-active context
        context: ContextId,
    },
    /// Close a context (also sent back as the closure acknowledgment)
    CloseContext {
        /// The context being closed
        context: ContextId,
    },
    /// One request invocation
    Request {
        /// Owning context
        context: ContextId,
        /// Identifier of the new request
        request: RequestId,
        /// Request payload
        payload: Item,
    },
    /// Terminal successful reply to a request
    Reply {
        /// Owning context
        context: ContextId,
        /// The request being answered
        request: RequestId,
        /// Reply payload
        payload: Item,
    },
    /// Terminal failure reply to a request
    ExceptionReply {
        /// Owning context
        context: ContextId,
        /// The request that failed
        request: RequestId,
        /// The remote failure
        failure: RemoteFailure,
    },
    /// Cooperative cancellation request
    CancelRequest {
        /// Owning context
        context: ContextId,
        /// The request to cancel
        request: RequestId,
        /// Best-effort interruption hint
        may_interrupt: bool,
    },
    /// Terminal acknowledgment that a request was cancelled
    CancelAcknowledge {
        /// Owning context
        context: ContextId,
        /// The cancelled request
        request: RequestId,
    },
    /// Open a stream on a context
    OpenStream {
        /// Identifier of the new stream
        stream: StreamId,
        /// Owning context
        context: ContextId,
    },
    /// One stream data message
    StreamData {
        /// Target stream
        stream: StreamId,
        /// Message payload
        payload: Item,
    },
    /// Producer-side failure surfaced on the stream's error channel
    StreamError {
        /// Target stream
        stream: StreamId,
        /// The failure
        failure: RemoteFailure,
    },
    /// One-way end-of-stream notice
    CloseStream {
        /// The closed stream
        stream: StreamId,
    },
    /// Heartbeat probe
    Ping,
    /// Heartbeat answer
    Pong,
    /// Session teardown notice; cascades on receipt
    CloseSession,
}

impl ProtocolMessage {
    /// Re-express every identifier from the receiving peer's perspective.
    ///
    /// Applied exactly once per wire crossing, by the transport, before the
    /// message is handed to the session.
    #[must_use]
    pub fn flip_origins(self) -> Self {
        match self {
            Self::OpenService { service, info } => {
                Self::OpenService { service: service.flip(), info }
            }
            Self::CloseService { service } => Self::CloseService { service: service.flip() },
            Self::OpenContext { context, service } => {
                Self::OpenContext { context: context.flip(), service: service.flip() }
            }
            Self::OpenedContext { context } => Self::OpenedContext { context: context.flip() },
            Self::CloseContext { context } => Self::CloseContext { context: context.flip() },
            Self::Request { context, request, payload } => {
                Self::Request { context: context.flip(), request: request.flip(), payload }
            }
            Self::Reply { context, request, payload } => {
                Self::Reply { context: context.flip(), request: request.flip(), payload }
            }
            Self::ExceptionReply { context, request, failure } => Self::ExceptionReply {
                context: context.flip(),
                request: request.flip(),
                failure,
            },
            Self::CancelRequest { context, request, may_interrupt } => Self::CancelRequest {
                context: context.flip(),
                request: request.flip(),
                may_interrupt,
            },
            Self::CancelAcknowledge { context, request } => {
                Self::CancelAcknowledge { context: context.flip(), request: request.flip() }
            }
            Self::OpenStream { stream, context } => {
                Self::OpenStream { stream: stream.flip(), context: context.flip() }
            }
            Self::StreamData { stream, payload } => {
                Self::StreamData { stream: stream.flip(), payload }
            }
            Self::StreamError { stream, failure } => {
                Self::StreamError { stream: stream.flip(), failure }
            }
            Self::CloseStream { stream } => Self::CloseStream { stream: stream.flip() },
            other @ (Self::Ping | Self::Pong | Self::CloseSession) => other,
        }
    }

    /// Apply a fallible transform to the payload, if this message carries
    /// one. Used by byte-oriented transports to run the resolver pipeline.
    ///
    /// # Errors
    ///
    /// Propagates the transform's error unchanged.
    pub fn try_map_payload<F, E>(self, f: F) -> Result<Self, E>
    where
        F: FnOnce(Item) -> Result<Item, E>,
    {
        Ok(match self {
            Self::Request { context, request, payload } => {
                Self::Request { context, request, payload: f(payload)? }
            }
            Self::Reply { context, request, payload } => {
                Self::Reply { context, request, payload: f(payload)? }
            }
            Self::StreamData { stream, payload } => {
                Self::StreamData { stream, payload: f(payload)? }
            }
            other => other,
        })
    }

    /// Short name for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenService { .. } => "open-service",
            Self::CloseService { .. } => "close-service",
            Self::OpenContext { .. } => "open-context",
            Self::OpenedContext { .. } => "opened-context",
            Self::CloseContext { .. } => "close-context",
            Self::Request { .. } => "request",
            Self::Reply { .. } => "reply",
            Self::ExceptionReply { .. } => "exception-reply",
            Self::CancelRequest { .. } => "cancel-request",
            Self::CancelAcknowledge { .. } => "cancel-acknowledge",
            Self::OpenStream { .. } => "open-stream",
            Self::StreamData { .. } => "stream-data",
            Self::StreamError { .. } => "stream-error",
            Self::CloseStream { .. } => "close-stream",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::CloseSession => "close-session",
        }
    }
}
