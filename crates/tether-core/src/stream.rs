//! Stream handles: ordered, unidirectional payload channels scoped to a
//! context.
//!
//! Each end of a stream holds a [`StreamHandle`]. Sending goes out through
//! the session's bound handler; receiving drains the channel the session
//! fills from inbound `StreamData` messages. Closure is one-way-observable:
//! after a close, data still in flight from the peer is dropped as an
//! anomaly rather than delivered.

use crate::error::Error;
use crate::ident::StreamId;
use crate::message::RemoteFailure;
use crate::session::SessionContext;
use std::fmt::Display;
use std::sync::Arc;
use tether_marshal::Item;
use tokio::sync::mpsc;

/// One endpoint's handle on a stream.
pub struct StreamHandle {
    id: StreamId,
    session: Arc<SessionContext>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Item, RemoteFailure>>>,
}

impl StreamHandle {
    pub(crate) fn new(
        id: StreamId,
        session: Arc<SessionContext>,
        incoming: mpsc::UnboundedReceiver<Result<Item, RemoteFailure>>,
    ) -> Self {
        Self { id, session, incoming: tokio::sync::Mutex::new(incoming) }
    }

    /// The stream's identifier.
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Send one payload item down the stream, preserving order.
    ///
    /// # Errors
    ///
    /// Fails if the stream was closed or transmission fails.
    pub async fn send(&self, item: Item) -> Result<(), Error> {
        self.session.handler()?.send_stream_data(self.id, item).await
    }

    /// Surface a producer-side failure to the consumer without tearing the
    /// stream down.
    ///
    /// # Errors
    ///
    /// Propagates transmission failure.
    pub async fn send_error(&self, failure: RemoteFailure) -> Result<(), Error> {
        self.session.handler()?.send_stream_error(self.id, failure).await
    }

    /// Receive the next item. `Ok(None)` is end-of-stream; `Err` carries a
    /// failure the producer surfaced.
    ///
    /// # Errors
    ///
    /// Returns the producer's [`RemoteFailure`] from the error channel.
    pub async fn receive(&self) -> Result<Option<Item>, RemoteFailure> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some(Ok(item)) => Ok(Some(item)),
            Some(Err(failure)) => Err(failure),
            None => Ok(None),
        }
    }

    /// Drive the stream from a fallible item source: each `Ok` item is sent
    /// in order; the first `Err` is surfaced on the error channel and stops
    /// the feed. The stream is closed afterwards either way.
    ///
    /// # Errors
    ///
    /// Propagates transmission failures.
    pub async fn feed<I, E>(&self, items: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = Result<Item, E>>,
        E: Display,
    {
        for item in items {
            match item {
                Ok(item) => self.send(item).await?,
                Err(err) => {
                    self.send_error(RemoteFailure::new(err.to_string())).await?;
                    break;
                }
            }
        }
        self.close().await
    }

    /// Close this stream. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates transmission failure.
    pub async fn close(&self) -> Result<(), Error> {
        self.session.handler()?.close_stream(self.id).await
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle").field("id", &self.id).finish_non_exhaustive()
    }
}
