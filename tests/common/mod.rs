//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use edge_gateway::config::GatewayConfig;
use edge_gateway::http::HttpServer;
use edge_gateway::lifecycle::Shutdown;
use edge_gateway::negotiation::ProtocolNegotiator;
use edge_gateway::observability::telemetry::TelemetrySink;
use edge_gateway::store::KvStore;

/// Serve `router` on an ephemeral port and return its address.
pub async fn start_upstream(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Defaults with short probe and forward timeouts so failures surface quickly.
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.negotiation.probe_timeout_ms = 1_000;
    config.timeouts.connect_secs = 2;
    config.timeouts.forward_secs = 5;
    config
}

pub struct TestGateway {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub negotiator: Arc<ProtocolNegotiator>,
    config_updates: mpsc::UnboundedSender<GatewayConfig>,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn origin(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn reload(&self, config: GatewayConfig) {
        self.config_updates.send(config).unwrap();
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

pub async fn start_gateway(
    config: GatewayConfig,
    store: Option<Arc<dyn KvStore>>,
) -> TestGateway {
    start_gateway_with_sink(config, store, None).await
}

pub async fn start_gateway_with_sink(
    config: GatewayConfig,
    store: Option<Arc<dyn KvStore>>,
    sink: Option<Arc<dyn TelemetrySink>>,
) -> TestGateway {
    let mut server = HttpServer::new(config, store).unwrap();
    if let Some(sink) = sink {
        server = server.with_telemetry_sink(sink);
    }
    let negotiator = server.negotiator().clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let (config_updates, updates_rx) = mpsc::unbounded_channel();
    let server_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, updates_rx, server_shutdown).await;
    });

    TestGateway {
        addr,
        shutdown,
        negotiator,
        config_updates,
    }
}

/// Client that never follows redirects, so Location headers can be inspected.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .build()
        .unwrap()
}
