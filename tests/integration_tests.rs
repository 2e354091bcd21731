//! End-to-end tests over real bindings: request/reply, cancellation,
//! context lifecycle, streams, and session teardown.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{
    CloseMode, EndpointConfig, InvocationError, ProtocolHandler, RequestContext, RequestListener,
    RequestOutcome, SessionContext,
};
use tether_integration_tests::test_helpers::{
    init_tracing, local_pair, local_pair_with, text_contract, CancellableListener, SilentListener,
    UppercaseListener,
};
use tether_marshal::{BufferPool, Item, Marshaller};
use tether_transport::FramedHandler;

/// Serves a request by pushing three integers down a stream, then replying.
struct StreamingListener;

#[async_trait]
impl RequestListener for StreamingListener {
    async fn on_request(&self, request: RequestContext, _payload: Item) {
        let outcome: Result<(), tether_core::Error> = async {
            let stream = request.open_stream().await?;
            stream
                .feed((1..=3).map(|i| Ok::<_, std::convert::Infallible>(Item::I64(i))))
                .await?;
            request.reply(Item::text("done")).await
        }
        .await;
        if let Err(err) = outcome {
            tracing::warn!(error = %err, "streaming request failed");
        }
    }
}

/// Pushes one item, then surfaces a producer failure on the error channel.
struct FailingFeedListener;

#[async_trait]
impl RequestListener for FailingFeedListener {
    async fn on_request(&self, request: RequestContext, _payload: Item) {
        let outcome: Result<(), tether_core::Error> = async {
            let stream = request.open_stream().await?;
            stream.feed(vec![Ok(Item::I64(1)), Err("source exploded")]).await?;
            request.reply(Item::text("partial")).await
        }
        .await;
        if let Err(err) = outcome {
            tracing::warn!(error = %err, "failing feed request errored locally");
        }
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within the deadline");
}

#[tokio::test]
async fn test_uppercase_invoke_and_context_id_reuse() {
    let (server, client) = local_pair("uppercase").await;
    server.publish(&text_contract(), Arc::new(UppercaseListener)).await.unwrap();

    let ctx = client.attach("String", "String", None).await.unwrap();
    let first_id = ctx.id();
    assert_eq!(ctx.invoke(Item::text("hello")).await.unwrap(), Item::text("HELLO"));
    ctx.close(CloseMode::Graceful).await.unwrap();

    // The identifier was released on the close acknowledgment, so the next
    // context takes the same value.
    let ctx = client.attach("String", "String", None).await.unwrap();
    assert_eq!(ctx.id().value(), first_id.value());
    assert_eq!(ctx.invoke(Item::text("again")).await.unwrap(), Item::text("AGAIN"));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_context_close_is_idempotent() {
    let (server, client) = local_pair("idempotent").await;
    server.publish(&text_contract(), Arc::new(UppercaseListener)).await.unwrap();

    let ctx = client.attach("String", "String", None).await.unwrap();
    ctx.close(CloseMode::Graceful).await.unwrap();
    ctx.close(CloseMode::Graceful).await.unwrap();
    ctx.close(CloseMode::Forced).await.unwrap();

    client.close().await.unwrap();
    server.close().await.unwrap();
    // closing the endpoint again is also a no-op
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_graceful_close_waits_for_reply() {
    let (server, client) = local_pair("graceful").await;
    server.publish(&text_contract(), Arc::new(UppercaseListener)).await.unwrap();

    let ctx = client.attach("String", "String", None).await.unwrap();
    let pending = ctx.send(Item::text("slowish")).await.unwrap();
    ctx.close(CloseMode::Graceful).await.unwrap();
    assert_eq!(pending.await_reply().await.unwrap(), Item::text("SLOWISH"));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_forced_close_cancels_in_flight() {
    let (server, client) = local_pair("forced").await;
    server.publish(&text_contract(), Arc::new(SilentListener)).await.unwrap();

    let ctx = client.attach("String", "String", None).await.unwrap();
    let pending = ctx.send(Item::text("doomed")).await.unwrap();
    ctx.close(CloseMode::Forced).await.unwrap();
    assert!(matches!(pending.await_reply().await, Err(InvocationError::Cancelled)));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_cancellation_round_trip() {
    let (server, client) = local_pair("cancel").await;
    server.publish(&text_contract(), Arc::new(CancellableListener)).await.unwrap();

    let ctx = client.attach("String", "String", None).await.unwrap();
    let pending = ctx.send(Item::text("interminable")).await.unwrap();
    pending.cancel(true).await.unwrap();
    assert!(matches!(pending.await_reply().await, Err(InvocationError::Cancelled)));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_stream_three_items_then_eos() {
    let (server, client) = local_pair("stream").await;
    server.publish(&text_contract(), Arc::new(StreamingListener)).await.unwrap();

    let ctx = client.attach("String", "String", None).await.unwrap();
    let pending = ctx.send(Item::text("go")).await.unwrap();
    let stream = ctx.accept_stream().await.unwrap();

    for expected in 1..=3 {
        assert_eq!(stream.receive().await.unwrap(), Some(Item::I64(expected)));
    }
    assert_eq!(stream.receive().await.unwrap(), None);
    assert_eq!(pending.await_reply().await.unwrap(), Item::text("done"));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_stream_error_surfaces_on_error_channel() {
    let (server, client) = local_pair("stream-error").await;
    server.publish(&text_contract(), Arc::new(FailingFeedListener)).await.unwrap();

    let ctx = client.attach("String", "String", None).await.unwrap();
    let pending = ctx.send(Item::text("go")).await.unwrap();
    let stream = ctx.accept_stream().await.unwrap();

    assert_eq!(stream.receive().await.unwrap(), Some(Item::I64(1)));
    let failure = stream.receive().await.unwrap_err();
    assert_eq!(failure.message, "source exploded");
    assert_eq!(stream.receive().await.unwrap(), None);
    assert_eq!(pending.await_reply().await.unwrap(), Item::text("partial"));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_session_close_cascades_to_peer() {
    let (server, client) = local_pair("cascade").await;
    server.publish(&text_contract(), Arc::new(SilentListener)).await.unwrap();

    let ctx = client.attach("String", "String", None).await.unwrap();
    let pending = ctx.send(Item::text("never answered")).await.unwrap();
    server.close().await.unwrap();

    assert!(matches!(pending.await_reply().await, Err(InvocationError::Closed)));
    wait_until(|| client.session().is_closed()).await;
    assert_eq!(client.session().stats().contexts, 0);
}

#[tokio::test]
async fn test_service_retract_closes_dependent_contexts() {
    let (server, client) = local_pair("retract").await;
    let service = server.publish(&text_contract(), Arc::new(UppercaseListener)).await.unwrap();

    let _ctx = client.attach("String", "String", None).await.unwrap();
    server.retract(service).await.unwrap();

    let client_session = Arc::clone(client.session());
    wait_until(move || client_session.stats().contexts == 0).await;

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_heartbeat_traffic_flows() {
    let server_config = EndpointConfig::builder("server").build();
    let client_config = EndpointConfig::builder("client")
        .heartbeat_interval(Duration::from_millis(10))
        .build();
    let (server, client) = local_pair_with("heartbeat", server_config, client_config).await;

    let server_session = Arc::clone(server.session());
    wait_until(move || server_session.stats().messages_received >= 2).await;

    client.close().await.unwrap();
    server.close().await.unwrap();
}

/// The same streaming semantics over the byte-oriented framed binding.
#[tokio::test]
async fn test_stream_over_framed_binding() {
    init_tracing();
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let server = SessionContext::new("server");
    let handler = FramedHandler::start(
        Arc::clone(&server),
        Marshaller::plain(),
        BufferPool::new(8, 4096),
        a_read,
        a_write,
    );
    server.bind_handler(handler).unwrap();

    let client = SessionContext::new("client");
    let handler = FramedHandler::start(
        Arc::clone(&client),
        Marshaller::plain(),
        BufferPool::new(8, 4096),
        b_read,
        b_write,
    );
    client.bind_handler(handler).unwrap();

    let service = server
        .handler()
        .unwrap()
        .open_service(&text_contract())
        .await
        .unwrap();
    server.attach_listener(service, Arc::new(StreamingListener)).unwrap();

    let remote = client.await_service("String", "String", None).await.unwrap();
    let client_handler = client.handler().unwrap();
    let context = client_handler.open_context(remote).await.unwrap();
    client.await_context_open(context).await.unwrap();

    let request = client_handler.open_request(context).await.unwrap();
    let receiver = client.claim_outcome(request).unwrap();
    client_handler.send_request(context, request, Item::text("go")).await.unwrap();

    let stream = client.accept_stream(context).await.unwrap();
    for expected in 1..=3 {
        assert_eq!(stream.receive().await.unwrap(), Some(Item::I64(expected)));
    }
    assert_eq!(stream.receive().await.unwrap(), None);
    assert_eq!(receiver.await.unwrap(), RequestOutcome::Replied(Item::text("done")));

    client.handler().unwrap().close_session().await.unwrap();
    server.handler().unwrap().close_session().await.unwrap();
}
