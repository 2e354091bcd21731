//! Tether core: session runtime for symmetric peer-to-peer messaging.
//!
//! Two connected endpoints each hold a [`SessionContext`] tracking four
//! kinds of entities: services, contexts, requests, and streams. Every
//! entity is named by a compact [`Identifier`](ident::Identifier) whose
//! origin half makes both peers' allocations collision-free, and every
//! state transition funnels through the session so the lifecycle
//! invariants hold regardless of which wire format carries the traffic.
//!
//! ```text
//!   application
//!       |  publish / attach / invoke / streams
//!   +---v--------+      +----------------+
//!   |  Endpoint  | ---> | SessionContext |  tables + allocator
//!   +------------+      +--------+-------+
//!                                |
//!                       +--------v--------+
//!                       | ProtocolHandler |  transport binding
//!                       +-----------------+
//! ```
//!
//! Transports implement [`ProtocolHandler`] (two required methods) and are
//! selected by URI scheme through a [`ProtocolRegistry`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod ident;
pub mod message;
pub mod session;
pub mod stream;

pub use config::{EndpointConfig, EndpointConfigBuilder};
pub use endpoint::{
    ClientContext, CloseMode, Endpoint, PendingReply, RequestContext, RequestListener,
};
pub use error::{
    Error, IdentError, InvocationError, ProtocolError, SessionError, TransportError,
};
pub use handler::{ProtocolHandler, ProtocolHandlerFactory, ProtocolRegistry};
pub use ident::{
    ContextId, IdAllocator, Identifier, Kind, Origin, RequestId, ServiceId, StreamId, ID_SPACE,
};
pub use message::{ProtocolMessage, RemoteFailure, ServiceInfo};
pub use session::{RequestOutcome, SessionContext, SessionStats};
pub use stream::StreamHandle;
