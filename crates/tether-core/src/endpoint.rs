//! The application-facing endpoint surface.
//!
//! An [`Endpoint`] ties a session to a transport picked from a
//! [`ProtocolRegistry`] by URI scheme. Services are published with a
//! [`RequestListener`]; peers attach to them through a [`ClientContext`]
//! and invoke requests that resolve through [`PendingReply`].
//!
//! ```text
//!   Endpoint::connect(config, registry, "local:server")
//!       |
//!       +-- publish(info, listener)      (server side)
//!       +-- attach(request, reply, _) -> ClientContext
//!                                          |
//!                                          +-- invoke(item) -> Item
//!                                          +-- send(item) -> PendingReply
//!                                          +-- open_stream() -> StreamHandle
//! ```

use crate::config::EndpointConfig;
use crate::error::{Error, InvocationError, TransportError};
use crate::handler::{ProtocolHandler, ProtocolRegistry};
use crate::ident::{ContextId, RequestId, ServiceId};
use crate::message::{ProtocolMessage, RemoteFailure, ServiceInfo};
use crate::session::{RequestOutcome, SessionContext};
use crate::stream::StreamHandle;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_marshal::Item;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Serves inbound requests for a published service.
#[async_trait]
pub trait RequestListener: Send + Sync {
    /// Handle one inbound request. The listener drives the terminal
    /// response itself through [`RequestContext::reply`] or
    /// [`RequestContext::fail`]; returning without either leaves the
    /// request open until cancelled or the context closes.
    async fn on_request(&self, request: RequestContext, payload: Item);
}

/// Server-side view of one inbound request.
pub struct RequestContext {
    session: Arc<SessionContext>,
    context: ContextId,
    request: RequestId,
    cancelled: Arc<AtomicBool>,
    may_interrupt: Arc<AtomicBool>,
}

impl RequestContext {
    pub(crate) fn new(
        session: Arc<SessionContext>,
        context: ContextId,
        request: RequestId,
        cancelled: Arc<AtomicBool>,
        may_interrupt: Arc<AtomicBool>,
    ) -> Self {
        Self { session, context, request, cancelled, may_interrupt }
    }

    /// The request's identifier.
    #[must_use]
    pub fn request(&self) -> RequestId {
        self.request
    }

    /// The owning context.
    #[must_use]
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// True once the peer has asked to cancel this request. Cooperative:
    /// a long-running listener polls this at convenient points.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Best-effort hint that the caller would accept interruption.
    #[must_use]
    pub fn may_interrupt(&self) -> bool {
        self.may_interrupt.load(Ordering::SeqCst)
    }

    /// Send the terminal successful reply. Exactly one terminal response
    /// wins; a second attempt observes `AlreadyCompleted`.
    ///
    /// # Errors
    ///
    /// Fails if a terminal response was already recorded or transmission
    /// fails.
    pub async fn reply(&self, payload: Item) -> Result<(), Error> {
        self.session.respond_inbound(self.request)?;
        self.session.handler()?.send_reply(self.context, self.request, payload).await
    }

    /// Send the terminal failure reply.
    ///
    /// # Errors
    ///
    /// Fails if a terminal response was already recorded or transmission
    /// fails.
    pub async fn fail(&self, failure: RemoteFailure) -> Result<(), Error> {
        self.session.respond_inbound(self.request)?;
        self.session.handler()?.send_exception(self.context, self.request, failure).await
    }

    /// Open a stream back to the caller on this request's context.
    ///
    /// # Errors
    ///
    /// Fails on a closed context or transmission failure.
    pub async fn open_stream(&self) -> Result<StreamHandle, Error> {
        let stream = self.session.handler()?.open_stream(self.context).await?;
        self.session.claim_stream_handle(stream)
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("context", &self.context)
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

/// How a context closure treats in-flight requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseMode {
    /// Wait for in-flight requests to drain before closing
    #[default]
    Graceful,
    /// Cancel in-flight requests and close immediately
    Forced,
}

/// An outstanding outbound request.
pub struct PendingReply {
    session: Arc<SessionContext>,
    context: ContextId,
    request: RequestId,
    receiver: oneshot::Receiver<RequestOutcome>,
}

impl PendingReply {
    /// The request's identifier.
    #[must_use]
    pub fn request(&self) -> RequestId {
        self.request
    }

    /// Ask the peer to cancel this request. The terminal outcome still
    /// arrives through [`await_reply`](Self::await_reply): either the
    /// cancellation acknowledgment or a reply that raced past it.
    ///
    /// # Errors
    ///
    /// Propagates transmission failure. A request already terminal is a
    /// no-op.
    pub async fn cancel(&self, may_interrupt: bool) -> Result<(), Error> {
        self.session
            .handler()?
            .send_cancel_request(self.context, self.request, may_interrupt)
            .await
    }

    /// Wait for the terminal outcome.
    ///
    /// # Errors
    ///
    /// Distinguishes remote execution failure, cancellation, and session
    /// closure.
    pub async fn await_reply(self) -> Result<Item, InvocationError> {
        match self.receiver.await {
            Ok(RequestOutcome::Replied(item)) => Ok(item),
            Ok(RequestOutcome::Failed(failure)) => Err(InvocationError::Remote(failure)),
            Ok(RequestOutcome::Cancelled) => Err(InvocationError::Cancelled),
            Err(_) => Err(InvocationError::Closed),
        }
    }
}

impl std::fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply")
            .field("context", &self.context)
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

/// Client-side handle on an open context.
pub struct ClientContext {
    session: Arc<SessionContext>,
    context: ContextId,
}

impl ClientContext {
    /// The context's identifier.
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.context
    }

    /// Send one request without waiting for the reply.
    ///
    /// # Errors
    ///
    /// Fails on a closed context, identifier exhaustion, or transmission
    /// failure. A transmission failure releases the allocated identifier.
    pub async fn send(&self, payload: Item) -> Result<PendingReply, Error> {
        let handler = self.session.handler()?;
        let request = handler.open_request(self.context).await?;
        let receiver = self.session.claim_outcome(request)?;
        if let Err(err) = handler.send_request(self.context, request, payload).await {
            self.session.abort_request(request);
            return Err(err);
        }
        Ok(PendingReply {
            session: Arc::clone(&self.session),
            context: self.context,
            request,
            receiver,
        })
    }

    /// Send one request and wait for its terminal outcome.
    ///
    /// # Errors
    ///
    /// See [`PendingReply::await_reply`]; local failures arrive as
    /// [`InvocationError::Local`].
    pub async fn invoke(&self, payload: Item) -> Result<Item, InvocationError> {
        self.send(payload).await?.await_reply().await
    }

    /// Open a stream toward the peer on this context.
    ///
    /// # Errors
    ///
    /// Fails on a closed context or transmission failure.
    pub async fn open_stream(&self) -> Result<StreamHandle, Error> {
        let stream = self.session.handler()?.open_stream(self.context).await?;
        self.session.claim_stream_handle(stream)
    }

    /// Wait for the peer to open a stream on this context.
    ///
    /// # Errors
    ///
    /// Fails once the context closes.
    pub async fn accept_stream(&self) -> Result<StreamHandle, Error> {
        self.session.accept_stream(self.context).await
    }

    /// Close this context and wait for the peer's acknowledgment; the
    /// identifier becomes reusable only after that acknowledgment.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates transmission failure.
    pub async fn close(&self, mode: CloseMode) -> Result<(), Error> {
        match mode {
            CloseMode::Graceful => self.session.drain_context(self.context).await,
            CloseMode::Forced => {
                let cancelled = self.session.cancel_context_requests(self.context);
                if !cancelled.is_empty() {
                    tracing::debug!(
                        context = %self.context,
                        count = cancelled.len(),
                        "in-flight requests cancelled by forced close"
                    );
                }
            }
        }
        self.session.handler()?.close_context(self.context).await?;
        self.session.await_context_closed(self.context).await;
        Ok(())
    }
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext").field("context", &self.context).finish_non_exhaustive()
    }
}

/// One endpoint: a session bound to a transport.
pub struct Endpoint {
    config: EndpointConfig,
    session: Arc<SessionContext>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl Endpoint {
    /// Connect to a peer named by `uri`, using whichever registered
    /// factory serves its scheme. Starts the heartbeat task if the
    /// configuration enables one.
    ///
    /// # Errors
    ///
    /// Fails if no factory accepts the scheme or the transport cannot
    /// reach the peer.
    pub async fn connect(
        config: EndpointConfig,
        registry: &ProtocolRegistry,
        uri: &str,
    ) -> Result<Self, Error> {
        let factory = registry
            .find(uri)
            .ok_or_else(|| TransportError::UnsupportedScheme(uri.to_string()))?;
        let session = SessionContext::new(config.name.clone());
        let handler =
            factory.create_handler(Arc::clone(&session), uri, &config.attributes).await?;
        session.bind_handler(Arc::clone(&handler))?;
        tracing::info!(endpoint = %config.name, %uri, "endpoint connected");

        let heartbeat = (config.heartbeat_interval > Duration::ZERO)
            .then(|| spawn_heartbeat(Arc::clone(&session), config.heartbeat_interval));
        Ok(Self { config, session, heartbeat: Mutex::new(heartbeat) })
    }

    /// This endpoint's configuration.
    #[must_use]
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// The underlying session.
    #[must_use]
    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    /// Publish a service: attach its listener, then advertise it to the
    /// peer. The listener is in place before the advertisement goes out,
    /// so no request can arrive unserved.
    ///
    /// # Errors
    ///
    /// Fails on identifier exhaustion or transmission failure.
    pub async fn publish(
        &self,
        info: &ServiceInfo,
        listener: Arc<dyn RequestListener>,
    ) -> Result<ServiceId, Error> {
        let handler = self.session.handler()?;
        let service = self.session.install_service(info.clone())?;
        self.session.attach_listener(service, listener)?;
        if let Err(err) = handler
            .dispatch(ProtocolMessage::OpenService { service, info: info.clone() })
            .await
        {
            self.session.abort_service(service);
            return Err(err.into());
        }
        Ok(service)
    }

    /// Retract a published service and close its contexts.
    ///
    /// # Errors
    ///
    /// Propagates transmission failure.
    pub async fn retract(&self, service: ServiceId) -> Result<(), Error> {
        self.session.handler()?.close_service(service).await
    }

    /// Wait for the peer to advertise a matching service, then open a
    /// context against it.
    ///
    /// # Errors
    ///
    /// Fails once the session closes, or on transmission failure.
    pub async fn attach(
        &self,
        request_type: &str,
        reply_type: &str,
        group: Option<&str>,
    ) -> Result<ClientContext, Error> {
        let service = self.session.await_service(request_type, reply_type, group).await?;
        self.open(service).await
    }

    /// Open a context against a known service and wait for the peer to
    /// bind it.
    ///
    /// # Errors
    ///
    /// Fails on unknown service, refused binding, or transmission failure.
    pub async fn open(&self, service: ServiceId) -> Result<ClientContext, Error> {
        let handler = self.session.handler()?;
        let context = handler.open_context(service).await?;
        self.session.await_context_open(context).await?;
        Ok(ClientContext { session: Arc::clone(&self.session), context })
    }

    /// Close the endpoint: stop the heartbeat, notify the peer, cascade
    /// local teardown, and shut the transport down. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates transport teardown failure.
    pub async fn close(&self) -> Result<(), Error> {
        if let Some(task) = lock_heartbeat(&self.heartbeat).take() {
            task.abort();
        }
        self.session.handler()?.close_session().await
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint").field("name", &self.config.name).finish_non_exhaustive()
    }
}

fn lock_heartbeat(
    heartbeat: &Mutex<Option<JoinHandle<()>>>,
) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
    match heartbeat.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn spawn_heartbeat(session: Arc<SessionContext>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if session.is_closed() {
                break;
            }
            // Recent inbound traffic already proves the link is alive;
            // ping only once it has gone quiet.
            if session.last_activity().elapsed() < interval / 2 {
                continue;
            }
            let Ok(handler) = session.handler() else { break };
            if let Err(err) = handler.send_ping().await {
                tracing::warn!(endpoint = session.name(), error = %err, "heartbeat failed");
                break;
            }
        }
    })
}
