//! The outbound-facing protocol handler surface and transport binding
//! contract.
//!
//! A transport implements [`ProtocolHandler::transmit`] (queue one message
//! toward the peer) and [`ProtocolHandler::shutdown`]; the entity
//! operations are provided methods that run identifier allocation and
//! session bookkeeping through the bound [`SessionContext`] before
//! transmitting, so every wire format drives the same session semantics.
//!
//! Close operations are idempotent at this boundary: closing an entity
//! twice is a no-op, not an error. Transmission failures propagate to the
//! caller of the failing operation and never close the session implicitly.

use crate::error::{Error, TransportError};
use crate::ident::{ContextId, RequestId, ServiceId, StreamId};
use crate::message::{ProtocolMessage, RemoteFailure, ServiceInfo};
use crate::session::SessionContext;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tether_marshal::Item;

/// Outbound protocol operations bound to one session.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// The session this handler allocates identifiers against.
    fn session(&self) -> &Arc<SessionContext>;

    /// Queue one protocol message toward the peer.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the transport is unavailable; the
    /// failure is scoped to this message.
    async fn transmit(&self, msg: ProtocolMessage) -> Result<(), TransportError>;

    /// Tear down the transport binding itself.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if teardown fails.
    async fn shutdown(&self) -> Result<(), TransportError>;

    /// True while the transport can still carry messages.
    fn is_open(&self) -> bool;

    /// Transmit with session accounting.
    ///
    /// # Errors
    ///
    /// Propagates the transmission failure.
    async fn dispatch(&self, msg: ProtocolMessage) -> Result<(), TransportError> {
        tracing::trace!(message = msg.name(), "dispatching");
        self.session().note_sent();
        self.transmit(msg).await
    }

    /// Allocate a service identifier and advertise the service to the peer.
    ///
    /// # Errors
    ///
    /// Fails on identifier exhaustion or transmission failure; the
    /// identifier is released again if the advertisement cannot be sent.
    async fn open_service(&self, info: &ServiceInfo) -> Result<ServiceId, Error> {
        let service = self.session().install_service(info.clone())?;
        if let Err(err) = self
            .dispatch(ProtocolMessage::OpenService { service, info: info.clone() })
            .await
        {
            self.session().abort_service(service);
            return Err(err.into());
        }
        Ok(service)
    }

    /// Allocate a context identifier and ask the peer to bind it to a
    /// service. The peer's acknowledgment arrives asynchronously.
    ///
    /// # Errors
    ///
    /// Fails on unknown service, identifier exhaustion, or transmission
    /// failure.
    async fn open_context(&self, service: ServiceId) -> Result<ContextId, Error> {
        let context = self.session().install_context(service)?;
        if let Err(err) = self.dispatch(ProtocolMessage::OpenContext { context, service }).await {
            self.session().abort_context(context);
            return Err(err.into());
        }
        Ok(context)
    }

    /// Allocate a request identifier on a context.
    ///
    /// The request itself is announced by [`send_request`](Self::send_request);
    /// no separate open notification crosses the wire.
    ///
    /// # Errors
    ///
    /// Fails on a closed context or identifier exhaustion.
    async fn open_request(&self, context: ContextId) -> Result<RequestId, Error> {
        self.session().install_request(context)
    }

    /// Allocate a stream identifier on a context and announce it.
    ///
    /// # Errors
    ///
    /// Fails on a closed context, identifier exhaustion, or transmission
    /// failure.
    async fn open_stream(&self, context: ContextId) -> Result<StreamId, Error> {
        let stream = self.session().install_stream(context)?;
        if let Err(err) = self.dispatch(ProtocolMessage::OpenStream { stream, context }).await {
            self.session().abort_stream(stream);
            return Err(err.into());
        }
        Ok(stream)
    }

    /// Transmit one request; `request` must have been allocated and not yet
    /// released.
    ///
    /// # Errors
    ///
    /// Propagates transmission failure to the caller.
    async fn send_request(
        &self,
        context: ContextId,
        request: RequestId,
        payload: Item,
    ) -> Result<(), Error> {
        let msg = self.session().create_request(context, request, payload);
        self.dispatch(msg).await?;
        self.session().mark_request_sent(request);
        Ok(())
    }

    /// Transmit the terminal successful reply for an inbound request.
    ///
    /// # Errors
    ///
    /// Propagates transmission failure.
    async fn send_reply(
        &self,
        context: ContextId,
        request: RequestId,
        payload: Item,
    ) -> Result<(), Error> {
        let msg = self.session().create_reply(context, request, payload);
        self.dispatch(msg).await.map_err(Into::into)
    }

    /// Transmit the terminal failure reply for an inbound request.
    ///
    /// # Errors
    ///
    /// Propagates transmission failure.
    async fn send_exception(
        &self,
        context: ContextId,
        request: RequestId,
        failure: RemoteFailure,
    ) -> Result<(), Error> {
        self.dispatch(ProtocolMessage::ExceptionReply { context, request, failure })
            .await
            .map_err(Into::into)
    }

    /// Ask the peer to cancel an outstanding request. Cooperative: only a
    /// terminal reply, exception, or cancel-acknowledge retires the id.
    ///
    /// # Errors
    ///
    /// Propagates transmission failure. A request already terminal is a
    /// no-op.
    async fn send_cancel_request(
        &self,
        context: ContextId,
        request: RequestId,
        may_interrupt: bool,
    ) -> Result<(), Error> {
        if !self.session().mark_cancel_pending(request) {
            return Ok(());
        }
        self.dispatch(ProtocolMessage::CancelRequest { context, request, may_interrupt })
            .await
            .map_err(Into::into)
    }

    /// Acknowledge an inbound cancellation as the terminal event.
    ///
    /// # Errors
    ///
    /// Propagates transmission failure.
    async fn send_cancel_acknowledge(
        &self,
        context: ContextId,
        request: RequestId,
    ) -> Result<(), Error> {
        self.dispatch(ProtocolMessage::CancelAcknowledge { context, request })
            .await
            .map_err(Into::into)
    }

    /// Transmit one stream data message.
    ///
    /// # Errors
    ///
    /// Fails on an unknown (closed) stream or transmission failure.
    async fn send_stream_data(&self, stream: StreamId, payload: Item) -> Result<(), Error> {
        self.session().ensure_stream(stream)?;
        self.dispatch(ProtocolMessage::StreamData { stream, payload })
            .await
            .map_err(Into::into)
    }

    /// Surface a producer-side failure on the stream's error channel.
    ///
    /// # Errors
    ///
    /// Propagates transmission failure.
    async fn send_stream_error(&self, stream: StreamId, failure: RemoteFailure) -> Result<(), Error> {
        self.dispatch(ProtocolMessage::StreamError { stream, failure })
            .await
            .map_err(Into::into)
    }

    /// Transmit a heartbeat probe.
    ///
    /// # Errors
    ///
    /// Propagates transmission failure.
    async fn send_ping(&self) -> Result<(), Error> {
        self.dispatch(ProtocolMessage::Ping).await.map_err(Into::into)
    }

    /// Answer a heartbeat probe.
    ///
    /// # Errors
    ///
    /// Propagates transmission failure.
    async fn send_pong(&self) -> Result<(), Error> {
        self.dispatch(ProtocolMessage::Pong).await.map_err(Into::into)
    }

    /// Close a stream; end-of-stream is one-way-observable. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates transmission failure.
    async fn close_stream(&self, stream: StreamId) -> Result<(), Error> {
        if !self.session().remove_stream(stream) {
            return Ok(());
        }
        self.dispatch(ProtocolMessage::CloseStream { stream })
            .await
            .map_err(Into::into)
    }

    /// Begin closing a context. The identifier is released only once the
    /// peer has acknowledged the closure. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates transmission failure.
    async fn close_context(&self, context: ContextId) -> Result<(), Error> {
        if !self.session().begin_context_close(context) {
            return Ok(());
        }
        self.dispatch(ProtocolMessage::CloseContext { context })
            .await
            .map_err(Into::into)
    }

    /// Close a service and every context bound to it. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates transmission failure.
    async fn close_service(&self, service: ServiceId) -> Result<(), Error> {
        if !self.session().remove_service(service) {
            return Ok(());
        }
        self.dispatch(ProtocolMessage::CloseService { service }).await?;
        for context in self.session().contexts_of(service) {
            self.close_context(context).await?;
        }
        Ok(())
    }

    /// Close the whole session: notify the peer (best-effort), cascade
    /// local teardown, and shut the transport binding down. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates transport teardown failure.
    async fn close_session(&self) -> Result<(), Error> {
        if self.session().is_closed() {
            return Ok(());
        }
        // The peer notice is best-effort; local teardown proceeds even if
        // the transport is already gone.
        if let Err(err) = self.dispatch(ProtocolMessage::CloseSession).await {
            tracing::debug!(error = %err, "close-session notice not delivered");
        }
        self.session().cascade_close();
        self.shutdown().await.map_err(Into::into)
    }
}

/// Creates protocol handlers for one URI scheme.
#[async_trait]
pub trait ProtocolHandlerFactory: Send + Sync {
    /// The URI scheme this factory serves (for example `"local"`).
    fn scheme(&self) -> &str;

    /// True if the URI refers to an in-process peer.
    fn is_local(&self, uri: &str) -> bool;

    /// Create a handler connecting `session` to the peer named by `uri`.
    ///
    /// `attributes` is the endpoint's opaque configuration map; factories
    /// interpret the keys they own and ignore the rest.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the peer cannot be reached or the URI is
    /// invalid for this factory.
    async fn create_handler(
        &self,
        session: Arc<SessionContext>,
        uri: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<Arc<dyn ProtocolHandler>, TransportError>;

    /// Release factory resources.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if teardown fails.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Explicit scheme-to-factory registry.
///
/// Passed to whatever constructs endpoints; there is deliberately no
/// process-wide singleton registry.
#[derive(Default)]
pub struct ProtocolRegistry {
    factories: DashMap<String, Arc<dyn ProtocolHandlerFactory>>,
}

impl ProtocolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under its scheme, replacing any previous one.
    pub fn register(&self, factory: Arc<dyn ProtocolHandlerFactory>) {
        self.factories.insert(factory.scheme().to_string(), factory);
    }

    /// Find the factory serving a URI's scheme.
    #[must_use]
    pub fn find(&self, uri: &str) -> Option<Arc<dyn ProtocolHandlerFactory>> {
        let scheme = uri.split(':').next()?;
        self.factories.get(scheme).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of registered factories.
    #[must_use]
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// True if no factories are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Close every registered factory and empty the registry.
    pub async fn close_all(&self) {
        let factories: Vec<_> =
            self.factories.iter().map(|entry| Arc::clone(entry.value())).collect();
        self.factories.clear();
        for factory in factories {
            if let Err(err) = factory.close().await {
                tracing::warn!(error = %err, "factory close failed");
            }
        }
    }
}

impl std::fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let schemes: Vec<String> =
            self.factories.iter().map(|entry| entry.key().clone()).collect();
        f.debug_struct("ProtocolRegistry").field("schemes", &schemes).finish()
    }
}
