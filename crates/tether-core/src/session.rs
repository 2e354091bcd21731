//! Session state: the single mutator of the entity tables.
//!
//! A [`SessionContext`] owns the identifier allocator and the four entity
//! tables (services, contexts, requests, streams). Outbound operations on
//! the bound [`ProtocolHandler`] allocate identifiers and install entries
//! through this type before transmitting; inbound traffic is handed to
//! [`SessionContext::deliver`], which dispatches to the `receive_*`
//! methods. Because every table mutation funnels through here, the
//! lifecycle invariants hold for any wire format.
//!
//! ```text
//!                 +--------------------+
//!   handler ----> |   SessionContext   | <---- transport (deliver)
//!   (allocate,    |  allocator + maps  |       (receive_*)
//!    install)     +--------------------+
//! ```
//!
//! Inbound messages that refer to unknown or already-retired identifiers
//! are anomalies: logged and dropped, the session continues. Structural
//! corruption is the transport's to detect; it reacts by forcing
//! [`SessionContext::cascade_close`].

use crate::endpoint::{RequestContext, RequestListener};
use crate::error::{anomaly, Error, SessionError};
use crate::handler::ProtocolHandler;
use crate::ident::{ContextId, IdAllocator, Origin, RequestId, ServiceId, StreamId};
use crate::message::{ProtocolMessage, RemoteFailure, ServiceInfo};
use crate::stream::StreamHandle;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Instant;
use tether_marshal::Item;
use tokio::sync::{mpsc, oneshot, Notify};

/// Lock a mutex, recovering the data from a poisoned lock.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Terminal outcome of an outbound request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// The peer replied successfully
    Replied(Item),
    /// The peer's listener raised an application failure
    Failed(RemoteFailure),
    /// The peer acknowledged cancellation
    Cancelled,
}

/// Point-in-time session counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Messages handed to the transport
    pub messages_sent: u64,
    /// Messages delivered by the transport
    pub messages_received: u64,
    /// Live service entries
    pub services: usize,
    /// Live context entries
    pub contexts: usize,
    /// Live request entries
    pub requests: usize,
    /// Live stream entries
    pub streams: usize,
    /// Whether the session has been closed
    pub closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContextState {
    Opening,
    Active,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestPhase {
    Open,
    Sent,
    CancelPending,
}

struct ServiceEntry {
    info: ServiceInfo,
    listener: Mutex<Option<Arc<dyn RequestListener>>>,
}

struct ContextEntry {
    service: ServiceId,
    state: Mutex<ContextState>,
    in_flight: AtomicUsize,
    drained: Notify,
    closed: Notify,
    open_tx: Mutex<Option<oneshot::Sender<()>>>,
    open_rx: Mutex<Option<oneshot::Receiver<()>>>,
    stream_tx: mpsc::UnboundedSender<StreamHandle>,
    stream_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<StreamHandle>>,
}

impl ContextEntry {
    fn new(service: ServiceId, state: ContextState) -> Self {
        let (open_tx, open_rx) = oneshot::channel();
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        let opening = state == ContextState::Opening;
        Self {
            service,
            state: Mutex::new(state),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            closed: Notify::new(),
            open_tx: Mutex::new(opening.then_some(open_tx)),
            open_rx: Mutex::new(opening.then_some(open_rx)),
            stream_tx,
            stream_rx: tokio::sync::Mutex::new(stream_rx),
        }
    }
}

struct OutboundRequest {
    context: ContextId,
    phase: Mutex<RequestPhase>,
    outcome_tx: Mutex<Option<oneshot::Sender<RequestOutcome>>>,
    outcome_rx: Mutex<Option<oneshot::Receiver<RequestOutcome>>>,
}

struct InboundRequest {
    context: ContextId,
    cancelled: Arc<AtomicBool>,
    may_interrupt: Arc<AtomicBool>,
}

enum RequestEntry {
    Outbound(OutboundRequest),
    Inbound(InboundRequest),
}

pub(crate) struct StreamEntry {
    pub(crate) context: ContextId,
    data_tx: mpsc::UnboundedSender<Result<Item, RemoteFailure>>,
    pending_handle: Mutex<Option<StreamHandle>>,
}

/// Shared, concurrency-safe session state for one endpoint.
pub struct SessionContext {
    name: String,
    this: Weak<SessionContext>,
    allocator: IdAllocator,
    services: DashMap<ServiceId, Arc<ServiceEntry>>,
    contexts: DashMap<ContextId, Arc<ContextEntry>>,
    requests: DashMap<RequestId, RequestEntry>,
    streams: DashMap<StreamId, Arc<StreamEntry>>,
    handler: OnceLock<Arc<dyn ProtocolHandler>>,
    closed: AtomicBool,
    sent: AtomicU64,
    received: AtomicU64,
    service_added: Notify,
    last_activity: Mutex<Instant>,
}

impl SessionContext {
    /// Create a session for a named endpoint.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name: name.into(),
            this: this.clone(),
            allocator: IdAllocator::new(),
            services: DashMap::new(),
            contexts: DashMap::new(),
            requests: DashMap::new(),
            streams: DashMap::new(),
            handler: OnceLock::new(),
            closed: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            service_added: Notify::new(),
            last_activity: Mutex::new(Instant::now()),
        })
    }

    /// The endpoint name this session belongs to.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The session's identifier allocator.
    #[must_use]
    pub fn allocator(&self) -> &IdAllocator {
        &self.allocator
    }

    /// Bind the transport handler. A session accepts exactly one binding.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AlreadyBound`] on a second binding attempt.
    pub fn bind_handler(&self, handler: Arc<dyn ProtocolHandler>) -> Result<(), SessionError> {
        self.handler.set(handler).map_err(|_| SessionError::AlreadyBound)
    }

    /// The bound transport handler.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::HandlerUnbound`] before binding.
    pub fn handler(&self) -> Result<Arc<dyn ProtocolHandler>, SessionError> {
        self.handler.get().map(Arc::clone).ok_or(SessionError::HandlerUnbound)
    }

    /// True once the session has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Instant of the most recent inbound message.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        *lock(&self.last_activity)
    }

    /// Snapshot the session counters.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_received: self.received.load(Ordering::Relaxed),
            services: self.services.len(),
            contexts: self.contexts.len(),
            requests: self.requests.len(),
            streams: self.streams.len(),
            closed: self.is_closed(),
        }
    }

    /// Count one transmitted message.
    pub fn note_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    fn strong(&self) -> Result<Arc<Self>, SessionError> {
        self.this.upgrade().ok_or(SessionError::Closed)
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    // ---- outbound installation (used by the handler's provided methods) ----

    /// Allocate a service identifier and install its entry.
    ///
    /// # Errors
    ///
    /// Fails if the session is closed or the identifier space is exhausted.
    pub fn install_service(&self, info: ServiceInfo) -> Result<ServiceId, Error> {
        self.ensure_open()?;
        let service = self.allocator.allocate_service()?;
        self.services
            .insert(service, Arc::new(ServiceEntry { info, listener: Mutex::new(None) }));
        tracing::debug!(endpoint = %self.name, %service, "service installed");
        Ok(service)
    }

    /// Attach the request listener for a locally opened service.
    ///
    /// # Errors
    ///
    /// Fails if the service is unknown.
    pub fn attach_listener(
        &self,
        service: ServiceId,
        listener: Arc<dyn RequestListener>,
    ) -> Result<(), Error> {
        let entry = self
            .services
            .get(&service)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(SessionError::UnknownService(service))?;
        *lock(&entry.listener) = Some(listener);
        Ok(())
    }

    /// Allocate a context identifier bound to a known service and install
    /// its entry in the opening state.
    ///
    /// # Errors
    ///
    /// Fails on unknown service, closed session, or identifier exhaustion.
    pub fn install_context(&self, service: ServiceId) -> Result<ContextId, Error> {
        self.ensure_open()?;
        if !self.services.contains_key(&service) {
            return Err(SessionError::UnknownService(service).into());
        }
        let context = self.allocator.allocate_context()?;
        self.contexts
            .insert(context, Arc::new(ContextEntry::new(service, ContextState::Opening)));
        tracing::debug!(endpoint = %self.name, %context, %service, "context installed");
        Ok(context)
    }

    /// Wait until the peer acknowledges a context opened locally.
    ///
    /// # Errors
    ///
    /// Fails if the context was closed or refused before activation.
    pub async fn await_context_open(&self, context: ContextId) -> Result<(), Error> {
        let entry = self
            .contexts
            .get(&context)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(SessionError::ContextClosed(context))?;
        let receiver = lock(&entry.open_rx).take();
        match receiver {
            Some(receiver) => receiver
                .await
                .map_err(|_| SessionError::ContextClosed(context).into()),
            None => {
                if *lock(&entry.state) == ContextState::Active {
                    Ok(())
                } else {
                    Err(SessionError::ContextClosed(context).into())
                }
            }
        }
    }

    /// Allocate a request identifier on an active context and install its
    /// outbound entry.
    ///
    /// # Errors
    ///
    /// Fails on an unknown or closing context, a closed session, or
    /// identifier exhaustion.
    pub fn install_request(&self, context: ContextId) -> Result<RequestId, Error> {
        self.ensure_open()?;
        let entry = self
            .contexts
            .get(&context)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(SessionError::UnknownContext(context))?;
        if *lock(&entry.state) != ContextState::Active {
            return Err(SessionError::ContextClosed(context).into());
        }
        let request = self.allocator.allocate_request()?;
        let (outcome_tx, outcome_rx) = oneshot::channel();
        self.requests.insert(
            request,
            RequestEntry::Outbound(OutboundRequest {
                context,
                phase: Mutex::new(RequestPhase::Open),
                outcome_tx: Mutex::new(Some(outcome_tx)),
                outcome_rx: Mutex::new(Some(outcome_rx)),
            }),
        );
        entry.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(request)
    }

    /// Take the outcome receiver for an outbound request. Claim it before
    /// transmitting so a fast reply cannot race the claim.
    ///
    /// # Errors
    ///
    /// Fails if the request is unknown or the receiver was already taken.
    pub fn claim_outcome(
        &self,
        request: RequestId,
    ) -> Result<oneshot::Receiver<RequestOutcome>, Error> {
        let entry = self.requests.get(&request).ok_or(SessionError::UnknownRequest(request))?;
        match entry.value() {
            RequestEntry::Outbound(out) => lock(&out.outcome_rx)
                .take()
                .ok_or(SessionError::AlreadyCompleted(request).into()),
            RequestEntry::Inbound(_) => Err(SessionError::UnknownRequest(request).into()),
        }
    }

    /// Record that an outbound request has crossed the wire.
    pub fn mark_request_sent(&self, request: RequestId) {
        if let Some(entry) = self.requests.get(&request) {
            if let RequestEntry::Outbound(out) = entry.value() {
                let mut phase = lock(&out.phase);
                if *phase == RequestPhase::Open {
                    *phase = RequestPhase::Sent;
                }
            }
        }
    }

    /// Flag an outbound request as cancel-pending. Returns false if the
    /// request is already terminal, so the cancel message can be skipped.
    pub fn mark_cancel_pending(&self, request: RequestId) -> bool {
        match self.requests.get(&request) {
            Some(entry) => match entry.value() {
                RequestEntry::Outbound(out) => {
                    *lock(&out.phase) = RequestPhase::CancelPending;
                    true
                }
                RequestEntry::Inbound(_) => false,
            },
            None => false,
        }
    }

    /// Allocate a stream identifier on an active context and install its
    /// entry; the local receiving half is claimed with
    /// [`claim_stream_handle`](Self::claim_stream_handle).
    ///
    /// # Errors
    ///
    /// Fails on an unknown or closing context, a closed session, or
    /// identifier exhaustion.
    pub fn install_stream(&self, context: ContextId) -> Result<StreamId, Error> {
        self.ensure_open()?;
        let entry = self
            .contexts
            .get(&context)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(SessionError::UnknownContext(context))?;
        if *lock(&entry.state) != ContextState::Active {
            return Err(SessionError::ContextClosed(context).into());
        }
        let stream = self.allocator.allocate_stream()?;
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let handle = StreamHandle::new(stream, self.strong()?, data_rx);
        self.streams.insert(
            stream,
            Arc::new(StreamEntry { context, data_tx, pending_handle: Mutex::new(Some(handle)) }),
        );
        Ok(stream)
    }

    /// Take the receiving half of a locally opened stream.
    ///
    /// # Errors
    ///
    /// Fails if the stream is unknown or the handle was already taken.
    pub fn claim_stream_handle(&self, stream: StreamId) -> Result<StreamHandle, Error> {
        let entry = self.streams.get(&stream).ok_or(SessionError::UnknownStream(stream))?;
        lock(&entry.pending_handle)
            .take()
            .ok_or(SessionError::UnknownStream(stream).into())
    }

    /// Wait for the peer to open a stream on the given context.
    ///
    /// # Errors
    ///
    /// Fails once the context closes.
    pub async fn accept_stream(&self, context: ContextId) -> Result<StreamHandle, Error> {
        let entry = self
            .contexts
            .get(&context)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(SessionError::UnknownContext(context))?;
        let mut receiver = entry.stream_rx.lock().await;
        tokio::select! {
            handle = receiver.recv() => {
                handle.ok_or_else(|| SessionError::ContextClosed(context).into())
            }
            () = self.await_context_closed(context) => {
                Err(SessionError::ContextClosed(context).into())
            }
        }
    }

    /// True if the stream is still live.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UnknownStream`] otherwise.
    pub fn ensure_stream(&self, stream: StreamId) -> Result<(), Error> {
        if self.streams.contains_key(&stream) {
            Ok(())
        } else {
            Err(SessionError::UnknownStream(stream).into())
        }
    }

    /// Remove a stream entry and release its identifier. Returns false if
    /// the stream was already gone, making closure idempotent.
    pub fn remove_stream(&self, stream: StreamId) -> bool {
        if self.streams.remove(&stream).is_none() {
            return false;
        }
        self.allocator.release(stream.id());
        true
    }

    /// Remove a published service and release its identifier. Returns
    /// false if the service was already gone, making retraction idempotent.
    pub fn remove_service(&self, service: ServiceId) -> bool {
        if self.services.remove(&service).is_none() {
            return false;
        }
        self.allocator.release(service.id());
        true
    }

    // ---- rollback on failed open transmission ----

    /// Remove and release a service whose advertisement never went out.
    pub fn abort_service(&self, service: ServiceId) {
        if self.services.remove(&service).is_some() {
            self.allocator.release(service.id());
        }
    }

    /// Remove and release a context whose open never went out.
    pub fn abort_context(&self, context: ContextId) {
        if self.contexts.remove(&context).is_some() {
            self.allocator.release(context.id());
        }
    }

    /// Remove and release a request that was never transmitted.
    pub fn abort_request(&self, request: RequestId) {
        if let Some((_, RequestEntry::Outbound(out))) = self
            .requests
            .remove_if(&request, |_, entry| matches!(entry, RequestEntry::Outbound(_)))
        {
            self.allocator.release(request.id());
            self.finish_request(out.context);
        }
    }

    /// Remove and release a stream whose open never went out.
    pub fn abort_stream(&self, stream: StreamId) {
        self.remove_stream(stream);
    }

    // ---- message factories ----

    /// Build the wire message for a request invocation.
    #[must_use]
    pub fn create_request(
        &self,
        context: ContextId,
        request: RequestId,
        payload: Item,
    ) -> ProtocolMessage {
        ProtocolMessage::Request { context, request, payload }
    }

    /// Build the wire message for a successful reply.
    #[must_use]
    pub fn create_reply(
        &self,
        context: ContextId,
        request: RequestId,
        payload: Item,
    ) -> ProtocolMessage {
        ProtocolMessage::Reply { context, request, payload }
    }

    // ---- service discovery ----

    /// Find a peer-advertised service matching the contract selector.
    #[must_use]
    pub fn find_service(
        &self,
        request_type: &str,
        reply_type: &str,
        group: Option<&str>,
    ) -> Option<ServiceId> {
        self.services.iter().find_map(|entry| {
            (entry.key().origin() == Origin::Remote
                && entry.value().info.matches(request_type, reply_type, group))
            .then(|| *entry.key())
        })
    }

    /// Wait until the peer advertises a matching service.
    ///
    /// # Errors
    ///
    /// Fails once the session closes.
    pub async fn await_service(
        &self,
        request_type: &str,
        reply_type: &str,
        group: Option<&str>,
    ) -> Result<ServiceId, Error> {
        loop {
            let notified = self.service_added.notified();
            if self.is_closed() {
                return Err(SessionError::Closed.into());
            }
            if let Some(service) = self.find_service(request_type, reply_type, group) {
                return Ok(service);
            }
            notified.await;
        }
    }

    /// Contexts currently bound to a service.
    #[must_use]
    pub fn contexts_of(&self, service: ServiceId) -> Vec<ContextId> {
        self.contexts
            .iter()
            .filter_map(|entry| (entry.value().service == service).then(|| *entry.key()))
            .collect()
    }

    // ---- context closure ----

    /// Transition a context into the closing state. Returns false if the
    /// context is unknown or already closing, making closure idempotent.
    pub fn begin_context_close(&self, context: ContextId) -> bool {
        let Some(entry) = self.contexts.get(&context).map(|entry| Arc::clone(entry.value()))
        else {
            return false;
        };
        let was_opening = {
            let mut state = lock(&entry.state);
            if *state == ContextState::Closing {
                return false;
            }
            let was_opening = *state == ContextState::Opening;
            *state = ContextState::Closing;
            was_opening
        };
        if was_opening {
            // A waiter may still be parked on the open acknowledgment;
            // dropping the sender resolves it with a closed-context error.
            drop(lock(&entry.open_tx).take());
        }
        true
    }

    /// Wait until a context has no in-flight requests.
    pub async fn drain_context(&self, context: ContextId) {
        let Some(entry) = self.contexts.get(&context).map(|entry| Arc::clone(entry.value()))
        else {
            return;
        };
        loop {
            let notified = entry.drained.notified();
            if entry.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait until a context entry has been removed.
    pub async fn await_context_closed(&self, context: ContextId) {
        let Some(entry) = self.contexts.get(&context).map(|entry| Arc::clone(entry.value()))
        else {
            return;
        };
        loop {
            let notified = entry.closed.notified();
            if !self.contexts.contains_key(&context) {
                return;
            }
            notified.await;
        }
    }

    /// Cancel every outbound request owned by a context, delivering a
    /// cancelled outcome to each waiter. Returns the cancelled ids.
    pub fn cancel_context_requests(&self, context: ContextId) -> Vec<RequestId> {
        let keys: Vec<RequestId> = self
            .requests
            .iter()
            .filter_map(|entry| match entry.value() {
                RequestEntry::Outbound(out) if out.context == context => Some(*entry.key()),
                _ => None,
            })
            .collect();
        let mut cancelled = Vec::with_capacity(keys.len());
        for key in keys {
            if self.complete_outbound(key, RequestOutcome::Cancelled) {
                cancelled.push(key);
            }
        }
        cancelled
    }

    // ---- inbound request completion ----

    /// Retire an inbound request because a terminal response is being sent.
    /// The first caller wins; later attempts observe `AlreadyCompleted`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AlreadyCompleted`] if a terminal response was
    /// already recorded.
    pub fn respond_inbound(&self, request: RequestId) -> Result<ContextId, SessionError> {
        match self
            .requests
            .remove_if(&request, |_, entry| matches!(entry, RequestEntry::Inbound(_)))
        {
            Some((_, RequestEntry::Inbound(inbound))) => {
                self.allocator.release(request.id());
                self.finish_request(inbound.context);
                Ok(inbound.context)
            }
            _ => Err(SessionError::AlreadyCompleted(request)),
        }
    }

    /// Retire an outbound request with its terminal outcome. The first
    /// terminal event wins; returns false for late duplicates.
    fn complete_outbound(&self, request: RequestId, outcome: RequestOutcome) -> bool {
        let Some((_, RequestEntry::Outbound(out))) = self
            .requests
            .remove_if(&request, |_, entry| matches!(entry, RequestEntry::Outbound(_)))
        else {
            return false;
        };
        if let Some(tx) = lock(&out.outcome_tx).take() {
            let _ = tx.send(outcome);
        }
        self.allocator.release(request.id());
        self.finish_request(out.context);
        true
    }

    fn finish_request(&self, context: ContextId) {
        if let Some(entry) = self.contexts.get(&context) {
            if entry.value().in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                entry.value().drained.notify_waiters();
            }
        }
    }

    // ---- inbound message API ----

    /// Dispatch one inbound message, already re-expressed in this peer's
    /// perspective.
    pub async fn deliver(self: &Arc<Self>, msg: ProtocolMessage) {
        if self.is_closed() {
            tracing::trace!(endpoint = %self.name, message = msg.name(), "dropped after close");
            return;
        }
        self.received.fetch_add(1, Ordering::Relaxed);
        *lock(&self.last_activity) = Instant::now();
        tracing::trace!(endpoint = %self.name, message = msg.name(), "delivering");
        match msg {
            ProtocolMessage::OpenService { service, info } => {
                self.receive_service_activate(service, info);
            }
            ProtocolMessage::CloseService { service } => self.receive_close_service(service).await,
            ProtocolMessage::OpenContext { context, service } => {
                self.receive_open_context(context, service).await;
            }
            ProtocolMessage::OpenedContext { context } => self.receive_opened_context(context),
            ProtocolMessage::CloseContext { context } => self.receive_close_context(context).await,
            ProtocolMessage::Request { context, request, payload } => {
                self.receive_request(context, request, payload).await;
            }
            ProtocolMessage::Reply { request, payload, .. } => {
                self.receive_reply(request, payload);
            }
            ProtocolMessage::ExceptionReply { request, failure, .. } => {
                self.receive_exception(request, failure);
            }
            ProtocolMessage::CancelRequest { context, request, may_interrupt } => {
                self.receive_cancel_request(context, request, may_interrupt).await;
            }
            ProtocolMessage::CancelAcknowledge { request, .. } => {
                self.receive_cancel_acknowledge(request);
            }
            ProtocolMessage::OpenStream { stream, context } => {
                self.receive_open_stream(stream, context);
            }
            ProtocolMessage::StreamData { stream, payload } => {
                self.receive_stream_data(stream, payload);
            }
            ProtocolMessage::StreamError { stream, failure } => {
                self.receive_stream_error(stream, failure);
            }
            ProtocolMessage::CloseStream { stream } => self.receive_close_stream(stream),
            ProtocolMessage::Ping => self.receive_ping().await,
            ProtocolMessage::Pong => {}
            ProtocolMessage::CloseSession => self.receive_close_session(),
        }
    }

    /// The peer advertised a service.
    pub fn receive_service_activate(&self, service: ServiceId, info: ServiceInfo) {
        if self.services.contains_key(&service) {
            anomaly("duplicate service advertisement", service.id());
            return;
        }
        self.services
            .insert(service, Arc::new(ServiceEntry { info, listener: Mutex::new(None) }));
        tracing::debug!(endpoint = %self.name, %service, "remote service activated");
        self.service_added.notify_waiters();
    }

    /// The peer closed a service; its contexts begin closing.
    pub async fn receive_close_service(&self, service: ServiceId) {
        if self.services.remove(&service).is_none() {
            anomaly("close for unknown service", service.id());
            return;
        }
        self.allocator.release(service.id());
        let dependents = self.contexts_of(service);
        for context in dependents {
            if self.begin_context_close(context) {
                if let Ok(handler) = self.handler() {
                    if let Err(err) = handler
                        .dispatch(ProtocolMessage::CloseContext { context })
                        .await
                    {
                        tracing::warn!(%context, error = %err, "context close not transmitted");
                    }
                }
            }
        }
        tracing::debug!(endpoint = %self.name, %service, "remote service closed");
    }

    /// The peer asks to bind a context to one of our services.
    pub async fn receive_open_context(&self, context: ContextId, service: ServiceId) {
        if self.contexts.contains_key(&context) {
            anomaly("duplicate context open", context.id());
            return;
        }
        if !self.services.contains_key(&service) {
            // The service is gone (retracted before this open arrived).
            // Refuse with a close so the opener resolves instead of
            // waiting for an acknowledgment that will never come.
            anomaly("context open for unknown service", service.id());
            if let Ok(handler) = self.handler() {
                if let Err(err) =
                    handler.dispatch(ProtocolMessage::CloseContext { context }).await
                {
                    tracing::warn!(%context, error = %err, "open refusal not transmitted");
                }
            }
            return;
        }
        self.contexts
            .insert(context, Arc::new(ContextEntry::new(service, ContextState::Active)));
        tracing::debug!(endpoint = %self.name, %context, %service, "context bound");
        if let Ok(handler) = self.handler() {
            if let Err(err) = handler.dispatch(ProtocolMessage::OpenedContext { context }).await {
                tracing::warn!(%context, error = %err, "context acknowledgment not transmitted");
            }
        }
    }

    /// The peer acknowledged a context we opened.
    pub fn receive_opened_context(&self, context: ContextId) {
        let Some(entry) = self.contexts.get(&context).map(|entry| Arc::clone(entry.value()))
        else {
            anomaly("acknowledgment for unknown context", context.id());
            return;
        };
        {
            let mut state = lock(&entry.state);
            if *state != ContextState::Opening {
                anomaly("duplicate context acknowledgment", context.id());
                return;
            }
            *state = ContextState::Active;
        }
        if let Some(tx) = lock(&entry.open_tx).take() {
            let _ = tx.send(());
        }
        tracing::debug!(endpoint = %self.name, %context, "context active");
    }

    /// The peer is closing a context, or acknowledging a close we started.
    ///
    /// Both directions carry the same message. A close of an active
    /// context is echoed back so the initiator can release the identifier;
    /// the initiator releases only on receipt of that echo, so the value
    /// cannot be reused while the peer still tracks it. A close arriving
    /// while the context is still opening is a refusal and resolves the
    /// pending open waiter with an error.
    pub async fn receive_close_context(&self, context: ContextId) {
        let Some((_, entry)) = self.contexts.remove(&context) else {
            anomaly("close for unknown context", context.id());
            return;
        };
        let prior = *lock(&entry.state);
        // A waiter parked on the open acknowledgment resolves with a
        // closed-context error once the sender is gone.
        drop(lock(&entry.open_tx).take());

        // Retire every request and stream still owned by the context.
        let request_keys: Vec<RequestId> = self
            .requests
            .iter()
            .filter_map(|e| {
                let owner = match e.value() {
                    RequestEntry::Outbound(out) => out.context,
                    RequestEntry::Inbound(inbound) => inbound.context,
                };
                (owner == context).then(|| *e.key())
            })
            .collect();
        for key in request_keys {
            if let Some((_, removed)) = self.requests.remove(&key) {
                if let RequestEntry::Outbound(out) = removed {
                    if let Some(tx) = lock(&out.outcome_tx).take() {
                        let _ = tx.send(RequestOutcome::Cancelled);
                    }
                }
                self.allocator.release(key.id());
            }
        }
        let stream_keys: Vec<StreamId> = self
            .streams
            .iter()
            .filter_map(|e| (e.value().context == context).then(|| *e.key()))
            .collect();
        for key in stream_keys {
            self.remove_stream(key);
        }

        // Echo only for a peer-initiated close of an active context. A
        // Closing context means we initiated and this is the echo itself;
        // an Opening context means the peer refused the open and never
        // tracked the context, so there is nothing to acknowledge.
        if prior == ContextState::Active {
            if let Ok(handler) = self.handler() {
                if let Err(err) = handler.dispatch(ProtocolMessage::CloseContext { context }).await
                {
                    tracing::warn!(%context, error = %err, "context close echo not transmitted");
                }
            }
        }
        self.allocator.release(context.id());
        entry.closed.notify_waiters();
        tracing::debug!(endpoint = %self.name, %context, "context closed");
    }

    /// The peer invoked a request; dispatch it to the service's listener.
    pub async fn receive_request(
        self: &Arc<Self>,
        context: ContextId,
        request: RequestId,
        payload: Item,
    ) {
        let Some(ctx) = self.contexts.get(&context).map(|entry| Arc::clone(entry.value()))
        else {
            anomaly("request on unknown context", context.id());
            return;
        };
        if self.requests.contains_key(&request) {
            anomaly("duplicate request", request.id());
            return;
        }
        let listener = self
            .services
            .get(&ctx.service)
            .and_then(|entry| lock(&entry.value().listener).clone());
        let Some(listener) = listener else {
            tracing::warn!(endpoint = %self.name, %request, "request for service with no listener");
            if let Ok(handler) = self.handler() {
                let failure = RemoteFailure::new(SessionError::NoListener(ctx.service).to_string());
                let _ = handler.send_exception(context, request, failure).await;
            }
            return;
        };
        let cancelled = Arc::new(AtomicBool::new(false));
        let may_interrupt = Arc::new(AtomicBool::new(false));
        self.requests.insert(
            request,
            RequestEntry::Inbound(InboundRequest {
                context,
                cancelled: Arc::clone(&cancelled),
                may_interrupt: Arc::clone(&may_interrupt),
            }),
        );
        ctx.in_flight.fetch_add(1, Ordering::SeqCst);
        let invocation =
            RequestContext::new(Arc::clone(self), context, request, cancelled, may_interrupt);
        tokio::spawn(async move {
            listener.on_request(invocation, payload).await;
        });
    }

    /// A terminal successful reply arrived for an outbound request.
    pub fn receive_reply(&self, request: RequestId, payload: Item) {
        if !self.complete_outbound(request, RequestOutcome::Replied(payload)) {
            anomaly("reply for unknown request", request.id());
        }
    }

    /// A terminal failure arrived for an outbound request.
    pub fn receive_exception(&self, request: RequestId, failure: RemoteFailure) {
        if !self.complete_outbound(request, RequestOutcome::Failed(failure)) {
            anomaly("exception for unknown request", request.id());
        }
    }

    /// The peer asked to cancel a request our listener is serving.
    ///
    /// The cancellation flag is raised for the running listener, and if no
    /// terminal response has been sent yet the acknowledgment becomes the
    /// terminal event. A listener that replies afterwards observes
    /// `AlreadyCompleted`.
    pub async fn receive_cancel_request(
        &self,
        context: ContextId,
        request: RequestId,
        may_interrupt: bool,
    ) {
        {
            let Some(entry) = self.requests.get(&request) else {
                // already terminal; benign race with our own reply
                tracing::trace!(%request, "cancel for retired request");
                return;
            };
            match entry.value() {
                RequestEntry::Inbound(inbound) => {
                    inbound.cancelled.store(true, Ordering::SeqCst);
                    if may_interrupt {
                        inbound.may_interrupt.store(true, Ordering::SeqCst);
                    }
                }
                RequestEntry::Outbound(_) => {
                    anomaly("cancel for outbound request", request.id());
                    return;
                }
            }
        }
        if self.respond_inbound(request).is_ok() {
            if let Ok(handler) = self.handler() {
                if let Err(err) = handler.send_cancel_acknowledge(context, request).await {
                    tracing::warn!(%request, error = %err, "cancel acknowledgment not transmitted");
                }
            }
        }
    }

    /// The peer acknowledged cancelling a request we sent.
    pub fn receive_cancel_acknowledge(&self, request: RequestId) {
        if !self.complete_outbound(request, RequestOutcome::Cancelled) {
            anomaly("cancel acknowledgment for unknown request", request.id());
        }
    }

    /// The peer opened a stream on one of our contexts.
    pub fn receive_open_stream(&self, stream: StreamId, context: ContextId) {
        let Some(ctx) = self.contexts.get(&context).map(|entry| Arc::clone(entry.value()))
        else {
            anomaly("stream open on unknown context", context.id());
            return;
        };
        if self.streams.contains_key(&stream) {
            anomaly("duplicate stream open", stream.id());
            return;
        }
        let Ok(session) = self.strong() else { return };
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let handle = StreamHandle::new(stream, session, data_rx);
        self.streams.insert(
            stream,
            Arc::new(StreamEntry { context, data_tx, pending_handle: Mutex::new(None) }),
        );
        if ctx.stream_tx.send(handle).is_err() {
            tracing::warn!(%stream, "stream handle dropped; context receiver gone");
        }
        tracing::debug!(endpoint = %self.name, %stream, %context, "stream opened by peer");
    }

    /// One stream data message arrived.
    pub fn receive_stream_data(&self, stream: StreamId, payload: Item) {
        let Some(entry) = self.streams.get(&stream).map(|entry| Arc::clone(entry.value()))
        else {
            // the peer may keep sending briefly after our close; drop
            anomaly("data for unknown stream", stream.id());
            return;
        };
        if entry.data_tx.send(Ok(payload)).is_err() {
            tracing::trace!(%stream, "stream data dropped; handle gone");
        }
    }

    /// A producer-side failure arrived on a stream's error channel.
    pub fn receive_stream_error(&self, stream: StreamId, failure: RemoteFailure) {
        let Some(entry) = self.streams.get(&stream).map(|entry| Arc::clone(entry.value()))
        else {
            anomaly("error for unknown stream", stream.id());
            return;
        };
        if entry.data_tx.send(Err(failure)).is_err() {
            tracing::trace!(%stream, "stream error dropped; handle gone");
        }
    }

    /// The peer closed a stream; end-of-stream is observed locally.
    pub fn receive_close_stream(&self, stream: StreamId) {
        if !self.remove_stream(stream) {
            anomaly("close for unknown stream", stream.id());
        }
    }

    /// Answer a heartbeat probe.
    pub async fn receive_ping(&self) {
        if let Ok(handler) = self.handler() {
            if let Err(err) = handler.send_pong().await {
                tracing::warn!(error = %err, "heartbeat answer not transmitted");
            }
        }
    }

    /// The peer tore its session down; cascade locally.
    pub fn receive_close_session(&self) {
        tracing::info!(endpoint = %self.name, "peer closed the session");
        self.cascade_close();
    }

    /// Force-close the session: mark it closed, retire every entity,
    /// release every identifier, and wake all waiters. Idempotent.
    ///
    /// Pending invocations observe a closed outcome instead of hanging.
    pub fn cascade_close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(endpoint = %self.name, "session closing; tearing down entities");

        let request_keys: Vec<RequestId> = self.requests.iter().map(|e| *e.key()).collect();
        for key in request_keys {
            if let Some((_, entry)) = self.requests.remove(&key) {
                // dropping the outcome sender surfaces a closed error at
                // the waiter
                drop(entry);
                self.allocator.release(key.id());
            }
        }
        let stream_keys: Vec<StreamId> = self.streams.iter().map(|e| *e.key()).collect();
        for key in stream_keys {
            self.remove_stream(key);
        }
        let context_keys: Vec<ContextId> = self.contexts.iter().map(|e| *e.key()).collect();
        for key in context_keys {
            if let Some((_, entry)) = self.contexts.remove(&key) {
                self.allocator.release(key.id());
                // a waiter parked on the open acknowledgment holds its own
                // clone of the entry, so the sender must be dropped here
                drop(lock(&entry.open_tx).take());
                entry.closed.notify_waiters();
            }
        }
        let service_keys: Vec<ServiceId> = self.services.iter().map(|e| *e.key()).collect();
        for key in service_keys {
            if self.services.remove(&key).is_some() {
                self.allocator.release(key.id());
            }
        }
        self.service_added.notify_waiters();
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
