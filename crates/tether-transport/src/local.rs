//! The in-process protocol binding.
//!
//! Two endpoints connect to the same link name (`local:<name>`); the first
//! arrival parks its session, the second pairs with it. Each handler pumps
//! its outbound queue into the peer's `SessionContext` with identifier
//! origins flipped, exactly as a byte-oriented transport would after
//! decoding. Per-sender ordering is preserved by the queue.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tether_core::{
    ProtocolHandler, ProtocolHandlerFactory, ProtocolMessage, SessionContext, TransportError,
};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

const SCHEME: &str = "local";

struct PendingLink {
    session: Arc<SessionContext>,
    peer_slot: Arc<OnceLock<Arc<SessionContext>>>,
    notify: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
}

/// Pairs endpoints connecting to the same `local:<name>` link.
#[derive(Default)]
pub struct LocalProtocolFactory {
    pending: DashMap<String, PendingLink>,
}

impl LocalProtocolFactory {
    /// Create a factory with no pending links.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_link(uri: &str) -> Result<&str, TransportError> {
        match uri.strip_prefix("local:") {
            Some(link) if !link.is_empty() => Ok(link),
            _ => Err(TransportError::InvalidConfig(format!("bad local URI: {uri}"))),
        }
    }
}

#[async_trait]
impl ProtocolHandlerFactory for LocalProtocolFactory {
    fn scheme(&self) -> &str {
        SCHEME
    }

    fn is_local(&self, uri: &str) -> bool {
        uri.starts_with("local:")
    }

    async fn create_handler(
        &self,
        session: Arc<SessionContext>,
        uri: &str,
        _attributes: &HashMap<String, String>,
    ) -> Result<Arc<dyn ProtocolHandler>, TransportError> {
        let link = Self::parse_link(uri)?;
        let handler = if let Some((_, pending)) = self.pending.remove(link) {
            if pending.cancelled.load(Ordering::SeqCst) {
                return Err(TransportError::ConnectionFailed(format!("link {link} was closed")));
            }
            // Second arrival: hand each side the other's session.
            let peer_slot = Arc::new(OnceLock::new());
            let _ = peer_slot.set(Arc::clone(&pending.session));
            let _ = pending.peer_slot.set(Arc::clone(&session));
            pending.notify.notify_waiters();
            tracing::debug!(link, peer = pending.session.name(), "local link paired");
            LocalHandler::start(session, peer_slot, Arc::new(Notify::new()), pending.cancelled)
        } else {
            let peer_slot = Arc::new(OnceLock::new());
            let notify = Arc::new(Notify::new());
            let cancelled = Arc::new(AtomicBool::new(false));
            self.pending.insert(
                link.to_string(),
                PendingLink {
                    session: Arc::clone(&session),
                    peer_slot: Arc::clone(&peer_slot),
                    notify: Arc::clone(&notify),
                    cancelled: Arc::clone(&cancelled),
                },
            );
            tracing::debug!(link, endpoint = session.name(), "local link pending");
            LocalHandler::start(session, peer_slot, notify, cancelled)
        };
        Ok(handler)
    }

    async fn close(&self) -> Result<(), TransportError> {
        for entry in self.pending.iter() {
            entry.value().cancelled.store(true, Ordering::SeqCst);
            entry.value().notify.notify_waiters();
        }
        self.pending.clear();
        Ok(())
    }
}

impl std::fmt::Debug for LocalProtocolFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProtocolFactory")
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// One side of a paired in-process link.
pub struct LocalHandler {
    session: Arc<SessionContext>,
    tx: Mutex<Option<mpsc::UnboundedSender<ProtocolMessage>>>,
    open: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl LocalHandler {
    fn start(
        session: Arc<SessionContext>,
        peer_slot: Arc<OnceLock<Arc<SessionContext>>>,
        notify: Arc<Notify>,
        cancelled: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump(rx, peer_slot, notify, cancelled));
        Arc::new(Self {
            session,
            tx: Mutex::new(Some(tx)),
            open: AtomicBool::new(true),
            pump: Mutex::new(Some(pump)),
        })
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<ProtocolMessage>> {
        match self.tx.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

async fn pump(
    mut rx: mpsc::UnboundedReceiver<ProtocolMessage>,
    peer_slot: Arc<OnceLock<Arc<SessionContext>>>,
    notify: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
) {
    while let Some(msg) = rx.recv().await {
        let peer = loop {
            // Arm the notification before checking the slot; pairing that
            // lands between the check and the await would otherwise be lost.
            let notified = notify.notified();
            if let Some(peer) = peer_slot.get() {
                break Arc::clone(peer);
            }
            if cancelled.load(Ordering::SeqCst) {
                tracing::debug!(message = msg.name(), "unpaired link cancelled; message dropped");
                return;
            }
            notified.await;
        };
        peer.deliver(msg.flip_origins()).await;
    }
}

#[async_trait]
impl ProtocolHandler for LocalHandler {
    fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    async fn transmit(&self, msg: ProtocolMessage) -> Result<(), TransportError> {
        let Some(tx) = self.sender() else {
            return Err(TransportError::Closed);
        };
        tx.send(msg).map_err(|_| TransportError::Closed)
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::SeqCst);
        // Dropping the sender lets the pump drain queued messages (the
        // close-session notice among them) before exiting.
        let tx = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(tx);
        if let Ok(mut guard) = self.pump.lock() {
            // Detach rather than abort; the drain finishes on its own.
            drop(guard.take());
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.session.is_closed()
    }
}

impl std::fmt::Debug for LocalHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHandler")
            .field("endpoint", &self.session.name())
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{
        CloseMode, Endpoint, EndpointConfig, ProtocolRegistry, RemoteFailure, RequestContext,
        RequestListener, ServiceInfo,
    };
    use tether_marshal::Item;

    struct Uppercase;

    #[async_trait]
    impl RequestListener for Uppercase {
        async fn on_request(&self, request: RequestContext, payload: Item) {
            let result = match payload.as_text() {
                Some(text) => request.reply(Item::text(text.to_uppercase())).await,
                None => request.fail(RemoteFailure::new("expected text")).await,
            };
            if let Err(err) = result {
                tracing::warn!(error = %err, "terminal response failed");
            }
        }
    }

    async fn pair(link: &str) -> (Endpoint, Endpoint) {
        let registry = ProtocolRegistry::new();
        registry.register(Arc::new(LocalProtocolFactory::new()));
        let uri = format!("local:{link}");
        let server =
            Endpoint::connect(EndpointConfig::builder("server").build(), &registry, &uri)
                .await
                .unwrap();
        let client =
            Endpoint::connect(EndpointConfig::builder("client").build(), &registry, &uri)
                .await
                .unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn test_bad_uri_is_rejected() {
        let registry = ProtocolRegistry::new();
        registry.register(Arc::new(LocalProtocolFactory::new()));
        let result = Endpoint::connect(
            EndpointConfig::builder("a").build(),
            &registry,
            "local:",
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_messages_queued_before_pairing_flow_after_pairing() {
        let factory = LocalProtocolFactory::new();
        let attributes = HashMap::new();
        let first = SessionContext::new("first");
        let handler = factory
            .create_handler(Arc::clone(&first), "local:late-pair", &attributes)
            .await
            .unwrap();
        first.bind_handler(Arc::clone(&handler)).unwrap();

        // Queue traffic while the link is unpaired and let the pump park
        // on the empty peer slot before the second side arrives.
        handler.transmit(ProtocolMessage::Ping).await.unwrap();
        tokio::task::yield_now().await;

        let second = SessionContext::new("second");
        let peer_handler = factory
            .create_handler(Arc::clone(&second), "local:late-pair", &attributes)
            .await
            .unwrap();
        second.bind_handler(peer_handler).unwrap();

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        while second.stats().messages_received == 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "queued message never delivered after pairing"
            );
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_uppercase_invoke_round_trip() {
        let (server, client) = pair("upper").await;
        server
            .publish(&ServiceInfo::new("String", "String"), Arc::new(Uppercase))
            .await
            .unwrap();

        let ctx = client.attach("String", "String", None).await.unwrap();
        let reply = ctx.invoke(Item::text("hello")).await.unwrap();
        assert_eq!(reply, Item::text("HELLO"));

        ctx.close(CloseMode::Graceful).await.unwrap();
        client.close().await.unwrap();
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_failure_is_distinguished() {
        let (server, client) = pair("failing").await;
        server
            .publish(&ServiceInfo::new("String", "String"), Arc::new(Uppercase))
            .await
            .unwrap();

        let ctx = client.attach("String", "String", None).await.unwrap();
        let err = ctx.invoke(Item::I64(3)).await.unwrap_err();
        assert!(err.is_remote());

        client.close().await.unwrap();
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_per_sender_ordering_preserved() {
        let (server, client) = pair("ordered").await;
        server
            .publish(&ServiceInfo::new("String", "String"), Arc::new(Uppercase))
            .await
            .unwrap();
        let ctx = client.attach("String", "String", None).await.unwrap();

        let mut pending = Vec::new();
        for i in 0..16 {
            pending.push(ctx.send(Item::text(format!("msg{i}"))).await.unwrap());
        }
        for (i, reply) in pending.into_iter().enumerate() {
            assert_eq!(reply.await_reply().await.unwrap(), Item::text(format!("MSG{i}")));
        }

        client.close().await.unwrap();
        server.close().await.unwrap();
    }
}
