//! Endpoint fixtures and listeners shared across the integration suites.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Once;
use tether_core::{
    Endpoint, EndpointConfig, ProtocolRegistry, RemoteFailure, RequestContext, RequestListener,
    ServiceInfo,
};
use tether_marshal::Item;
use tether_transport::LocalProtocolFactory;

static INIT: Once = Once::new();

/// Install a test-friendly tracing subscriber once per process.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Connect a server/client endpoint pair over the in-process binding.
pub async fn local_pair(link: &str) -> (Endpoint, Endpoint) {
    local_pair_with(link, EndpointConfig::builder("server").build(), EndpointConfig::builder("client").build()).await
}

/// Connect a pair with explicit per-side configuration.
pub async fn local_pair_with(
    link: &str,
    server_config: EndpointConfig,
    client_config: EndpointConfig,
) -> (Endpoint, Endpoint) {
    init_tracing();
    let registry = ProtocolRegistry::new();
    registry.register(Arc::new(LocalProtocolFactory::new()));
    let uri = format!("local:{link}");
    let server = Endpoint::connect(server_config, &registry, &uri)
        .await
        .expect("server endpoint");
    let client = Endpoint::connect(client_config, &registry, &uri)
        .await
        .expect("client endpoint");
    (server, client)
}

/// The usual service contract used by the suites.
pub fn text_contract() -> ServiceInfo {
    ServiceInfo::new("String", "String")
}

/// Replies with the uppercased request text; fails on non-text payloads.
pub struct UppercaseListener;

#[async_trait]
impl RequestListener for UppercaseListener {
    async fn on_request(&self, request: RequestContext, payload: Item) {
        let result = match payload.as_text() {
            Some(text) => request.reply(Item::text(text.to_uppercase())).await,
            None => request.fail(RemoteFailure::new("expected a text payload")).await,
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, "terminal response failed");
        }
    }
}

/// Never sends a terminal response; requests stay open until cancelled or
/// the context closes.
pub struct SilentListener;

#[async_trait]
impl RequestListener for SilentListener {
    async fn on_request(&self, _request: RequestContext, _payload: Item) {}
}

/// Polls the cancellation flag and exits without replying once it is set.
pub struct CancellableListener;

#[async_trait]
impl RequestListener for CancellableListener {
    async fn on_request(&self, request: RequestContext, _payload: Item) {
        while !request.is_cancelled() {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
    }
}
