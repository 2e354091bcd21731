//! Byte-oriented protocol binding over any async duplex.
//!
//! A [`FramedHandler`] drives a session over an `AsyncRead`/`AsyncWrite`
//! pair using the length-prefixed frame codec. Outbound messages run their
//! payloads through the marshaller's write-side resolver pipeline before
//! encoding; inbound frames run the read-side pipeline, then origin
//! flipping, then delivery. Frames are staged through the buffer pool.
//!
//! Structural corruption on the inbound path (oversized or undecodable
//! frame) and a disappearing peer both cascade the session closed.

use crate::frame::{self, FrameDecoder, FrameError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tether_core::{ProtocolHandler, ProtocolMessage, SessionContext, TransportError};
use tether_marshal::{BufferPool, Marshaller};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const READ_CHUNK: usize = 8192;

/// Frame-based protocol handler over an async byte duplex.
pub struct FramedHandler {
    session: Arc<SessionContext>,
    tx: Mutex<Option<mpsc::UnboundedSender<ProtocolMessage>>>,
    open: Arc<AtomicBool>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl FramedHandler {
    /// Start the binding: spawns the reader and writer tasks and returns
    /// the handler to bind to the session.
    pub fn start<R, W>(
        session: Arc<SessionContext>,
        marshaller: Marshaller,
        pool: Arc<BufferPool>,
        reader: R,
        writer: W,
    ) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        tokio::spawn(write_loop(
            rx,
            writer,
            marshaller.clone(),
            pool,
            Arc::clone(&session),
            Arc::clone(&open),
        ));
        let reader_task = tokio::spawn(read_loop(
            reader,
            marshaller,
            Arc::clone(&session),
            Arc::clone(&open),
        ));
        Arc::new(Self {
            session,
            tx: Mutex::new(Some(tx)),
            open,
            reader_task: Mutex::new(Some(reader_task)),
        })
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<ProtocolMessage>> {
        match self.tx.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl ProtocolHandler for FramedHandler {
    fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    async fn transmit(&self, msg: ProtocolMessage) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let Some(tx) = self.sender() else {
            return Err(TransportError::Closed);
        };
        tx.send(msg).map_err(|_| TransportError::Closed)
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::SeqCst);
        // Dropping the sender lets the writer drain queued frames and
        // shut the write half down.
        let tx = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(tx);
        let reader = match self.reader_task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(reader) = reader {
            reader.abort();
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.session.is_closed()
    }
}

impl std::fmt::Debug for FramedHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedHandler")
            .field("endpoint", &self.session.name())
            .field("open", &self.is_open())
            .finish()
    }
}

async fn write_loop<W>(
    mut rx: mpsc::UnboundedReceiver<ProtocolMessage>,
    mut writer: W,
    marshaller: Marshaller,
    pool: Arc<BufferPool>,
    session: Arc<SessionContext>,
    open: Arc<AtomicBool>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(msg) = rx.recv().await {
        let resolved = match msg.try_map_payload(|item| marshaller.apply_write(item)) {
            Ok(resolved) => resolved,
            Err(err) => {
                tracing::warn!(error = %err, "payload resolution failed; message dropped");
                continue;
            }
        };
        let outcome = match pool.allocate() {
            Some(mut buffer) => {
                let result = match frame::encode_into(&resolved, buffer.vec_mut()) {
                    Ok(()) => writer.write_all(buffer.as_slice()).await.map_err(FrameError::from),
                    Err(err) => Err(err),
                };
                pool.free(buffer);
                result
            }
            // Pool exhausted; encode on the heap rather than stall.
            None => match frame::encode_frame(&resolved) {
                Ok(bytes) => writer.write_all(&bytes).await.map_err(FrameError::from),
                Err(err) => Err(err),
            },
        };
        match outcome {
            Ok(()) => {
                if let Err(err) = writer.flush().await {
                    tracing::error!(error = %err, "frame flush failed; closing session");
                    open.store(false, Ordering::SeqCst);
                    session.cascade_close();
                    break;
                }
            }
            Err(FrameError::Io(err)) => {
                tracing::error!(error = %err, "frame transmission failed; closing session");
                open.store(false, Ordering::SeqCst);
                session.cascade_close();
                break;
            }
            Err(err) => {
                // Encode failures are scoped to this message.
                tracing::warn!(error = %err, "frame encoding failed; message dropped");
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<R>(
    mut reader: R,
    marshaller: Marshaller,
    session: Arc<SessionContext>,
    open: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut decoder = FrameDecoder::new();
    loop {
        let read = match reader.read(&mut chunk).await {
            Ok(0) => {
                tracing::info!(endpoint = session.name(), "peer closed the connection");
                open.store(false, Ordering::SeqCst);
                session.cascade_close();
                return;
            }
            Ok(read) => read,
            Err(err) => {
                tracing::error!(error = %err, "read failed; closing session");
                open.store(false, Ordering::SeqCst);
                session.cascade_close();
                return;
            }
        };
        decoder.extend(&chunk[..read]);
        loop {
            match decoder.next_frame() {
                Ok(Some(msg)) => {
                    let msg = match msg.try_map_payload(|item| marshaller.apply_read(item)) {
                        Ok(msg) => msg,
                        Err(err) => {
                            tracing::warn!(error = %err, "payload restoration failed; frame dropped");
                            continue;
                        }
                    };
                    session.deliver(msg.flip_origins()).await;
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::error!(error = %err, "structural corruption; closing session");
                    open.store(false, Ordering::SeqCst);
                    session.cascade_close();
                    return;
                }
            }
        }
        if session.is_closed() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{RemoteFailure, RequestContext, RequestListener, ServiceInfo};
    use tether_marshal::Item;

    struct Echo;

    #[async_trait]
    impl RequestListener for Echo {
        async fn on_request(&self, request: RequestContext, payload: Item) {
            let result = request.reply(payload).await;
            if let Err(err) = result {
                tracing::warn!(error = %err, "terminal response failed");
            }
        }
    }

    fn framed_session(
        name: &str,
        reader: tokio::io::ReadHalf<tokio::io::DuplexStream>,
        writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
    ) -> Arc<SessionContext> {
        let session = SessionContext::new(name);
        let handler = FramedHandler::start(
            Arc::clone(&session),
            Marshaller::plain(),
            BufferPool::new(8, 4096),
            reader,
            writer,
        );
        session.bind_handler(handler).unwrap();
        session
    }

    fn framed_pair() -> (Arc<SessionContext>, Arc<SessionContext>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (framed_session("a", a_read, a_write), framed_session("b", b_read, b_write))
    }

    #[tokio::test]
    async fn test_invoke_over_duplex() {
        let (server, client) = framed_pair();
        let handler = server.handler().unwrap();
        let service = handler.open_service(&ServiceInfo::new("String", "String")).await.unwrap();
        server.attach_listener(service, Arc::new(Echo)).unwrap();

        let remote = client.await_service("String", "String", None).await.unwrap();
        let client_handler = client.handler().unwrap();
        let context = client_handler.open_context(remote).await.unwrap();
        client.await_context_open(context).await.unwrap();

        let request = client_handler.open_request(context).await.unwrap();
        let receiver = client.claim_outcome(request).unwrap();
        client_handler.send_request(context, request, Item::text("ping")).await.unwrap();

        use tether_core::RequestOutcome;
        assert_eq!(receiver.await.unwrap(), RequestOutcome::Replied(Item::text("ping")));
    }

    #[tokio::test]
    async fn test_corrupt_bytes_cascade_close() {
        let (raw, peer) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(peer);
        let session = framed_session("victim", read_half, write_half);

        let (raw_read, mut raw_write) = tokio::io::split(raw);
        // Oversized length prefix.
        raw_write.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        raw_write.flush().await.unwrap();

        // The session cascades closed once the corruption is observed.
        let mut tries = 0;
        while !session.is_closed() && tries < 100 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            tries += 1;
        }
        assert!(session.is_closed());
        drop(raw_read);
    }

    #[tokio::test]
    async fn test_peer_disconnect_cascade_close() {
        let (server, client) = framed_pair();
        client.handler().unwrap().close_session().await.unwrap();

        let mut tries = 0;
        while !server.is_closed() && tries < 100 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            tries += 1;
        }
        assert!(server.is_closed());
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_resolver_pipeline_applies_on_the_wire() {
        use tether_marshal::{
            Item, MarkerKind, MarshalError, MarshallerConfig, ObjectResolver, ResolverChain,
        };

        struct Tagger;
        impl ObjectResolver for Tagger {
            fn substitute_on_write(&self, item: Item) -> Result<Item, MarshalError> {
                match item {
                    Item::Text(s) if s == "secret" => {
                        Ok(Item::Marker { kind: MarkerKind::Proxy, id: 1 })
                    }
                    other => Ok(other),
                }
            }
            fn restore_on_read(&self, item: Item) -> Result<Item, MarshalError> {
                match item {
                    Item::Marker { kind: MarkerKind::Proxy, id: 1 } => {
                        Ok(Item::text("secret"))
                    }
                    other => Ok(other),
                }
            }
        }

        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let chain = ResolverChain::new().with(Arc::new(Tagger));
        let server = SessionContext::new("server");
        let server_handler = FramedHandler::start(
            Arc::clone(&server),
            Marshaller::new(MarshallerConfig::default(), chain.clone()),
            BufferPool::new(8, 4096),
            a_read,
            a_write,
        );
        server.bind_handler(server_handler).unwrap();
        let client = SessionContext::new("client");
        let client_handler = FramedHandler::start(
            Arc::clone(&client),
            Marshaller::new(MarshallerConfig::default(), chain),
            BufferPool::new(8, 4096),
            b_read,
            b_write,
        );
        client.bind_handler(client_handler).unwrap();

        let service = server
            .handler()
            .unwrap()
            .open_service(&ServiceInfo::new("String", "String"))
            .await
            .unwrap();
        server.attach_listener(service, Arc::new(Echo)).unwrap();

        let remote = client.await_service("String", "String", None).await.unwrap();
        let handler = client.handler().unwrap();
        let context = handler.open_context(remote).await.unwrap();
        client.await_context_open(context).await.unwrap();
        let request = handler.open_request(context).await.unwrap();
        let receiver = client.claim_outcome(request).unwrap();
        handler.send_request(context, request, Item::text("secret")).await.unwrap();

        use tether_core::RequestOutcome;
        // Substituted on the way out, restored on the way back in.
        assert_eq!(receiver.await.unwrap(), RequestOutcome::Replied(Item::text("secret")));
    }
}
