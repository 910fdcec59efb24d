//! HTTP server setup and the gateway request pipeline.
//!
//! # Responsibilities
//! - Create the Axum router with the single catch-all handler
//! - Wire up middleware (timeout, request id, tracing, panic capture)
//! - Dispatch requests: bot filter → fixed routes → resolve → access → negotiate
//!   → forward or tunnel
//! - Stamp every response with gateway timing and identity headers
//! - Apply config reloads and stop on shutdown
//!
//! # Request Pipeline
//! ```text
//! request
//!   → bot filter             (403 text/plain)
//!   → "/"                    (status page)
//!   → "/health"              (200 OK)
//!   → OPTIONS                (204 preflight)
//!   → resolve_target         (None → status page)
//!   → AccessPolicy           (403 JSON)
//!   → ProtocolNegotiator
//!   → telemetry
//!   → websocket::tunnel | Forwarder::forward
//!   → finalize headers
//! ```

use std::any::Any;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ws::WebSocketUpgrade, ConnectInfo, FromRequestParts, State},
    http::{header, HeaderName, HeaderValue, Method, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::{GatewayConfig, RuntimeConfig};
use crate::error::{internal_error_response, GatewayError};
use crate::http::forward::Forwarder;
use crate::http::request::{ProxyContext, X_REQUEST_ID};
use crate::http::response::{apply_cors, preflight_response, X_PROXY_PROTOCOL};
use crate::http::status::{DefaultStatusPage, StatusPage};
use crate::http::websocket;
use crate::negotiation::{HttpsProbe, ProtocolNegotiator, ProtocolProbe};
use crate::net::tls::load_tls_config;
use crate::observability::metrics;
use crate::observability::telemetry::{record_playback, LogSink, TelemetrySink};
use crate::routing::target::resolve_target;
use crate::security::bot::is_blocked_agent;
use crate::store::KvStore;

pub const X_PROXY_TIME: &str = "x-proxy-time";
pub const X_PROXY_EDGE: &str = "x-proxy-edge";
pub const X_PROXY_VERSION: &str = "x-proxy-version";

const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(10);

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub negotiator: Arc<ProtocolNegotiator>,
    pub forwarder: Forwarder,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub status_page: Arc<dyn StatusPage>,
}

/// HTTP server for the gateway.
pub struct HttpServer {
    state: AppState,
}

impl HttpServer {
    /// Create a server with the default https probe.
    pub fn new(
        config: GatewayConfig,
        store: Option<Arc<dyn KvStore>>,
    ) -> Result<Self, reqwest::Error> {
        let probe = Arc::new(HttpsProbe::new(Duration::from_millis(
            config.negotiation.probe_timeout_ms,
        ))?);
        Self::with_probe(config, store, probe)
    }

    pub fn with_probe(
        config: GatewayConfig,
        store: Option<Arc<dyn KvStore>>,
        probe: Arc<dyn ProtocolProbe>,
    ) -> Result<Self, reqwest::Error> {
        let forwarder = Forwarder::new(&config.timeouts)?;
        let negotiator = Arc::new(ProtocolNegotiator::new(
            &config.negotiation,
            store.clone(),
            probe,
            Duration::from_millis(config.store.write_timeout_ms),
        ));
        let runtime = Arc::new(RuntimeConfig::new(config, store));

        Ok(Self {
            state: AppState {
                runtime,
                negotiator,
                forwarder,
                telemetry: Arc::new(LogSink),
                status_page: Arc::new(DefaultStatusPage),
            },
        })
    }

    pub fn with_telemetry_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.state.telemetry = sink;
        self
    }

    pub fn with_status_page(mut self, page: Arc<dyn StatusPage>) -> Self {
        self.state.status_page = page;
        self
    }

    pub fn runtime(&self) -> &Arc<RuntimeConfig> {
        &self.state.runtime
    }

    pub fn negotiator(&self) -> &Arc<ProtocolNegotiator> {
        &self.state.negotiator
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    pub fn router(&self) -> Router {
        let request_timeout = Duration::from_secs(self.state.runtime.load().config.timeouts.request_secs);
        let request_id = HeaderName::from_static(X_REQUEST_ID);

        Router::new()
            .route("/{*path}", any(gateway_handler))
            .route("/", any(gateway_handler))
            .with_state(self.state.clone())
            .layer(TimeoutLayer::new(request_timeout))
            .layer(PropagateRequestIdLayer::new(request_id.clone()))
            .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                let request_id = request
                    .headers()
                    .get(X_REQUEST_ID)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown");
                tracing::info_span!(
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            }))
            .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
            .layer(CatchPanicLayer::custom(handle_panic))
    }

    /// Serve on `listener` until `shutdown` fires. Configs received on
    /// `config_updates` replace the file layer of the runtime config.
    pub async fn run(
        self,
        listener: TcpListener,
        mut config_updates: mpsc::UnboundedReceiver<GatewayConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        let tls = self.state.runtime.load().config.listener.tls.clone();
        tracing::info!(address = %addr, tls = tls.is_some(), "HTTP server starting");

        let runtime = self.state.runtime.clone();
        let mut reload_shutdown = shutdown.resubscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(config) = config_updates.recv() => {
                        runtime.apply_base(config).await;
                    }
                    _ = reload_shutdown.recv() => break,
                    else => break,
                }
            }
        });

        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();

        match tls {
            Some(tls) => {
                let rustls = load_tls_config(Path::new(&tls.cert_path), Path::new(&tls.key_path)).await?;
                let handle = axum_server::Handle::new();
                let shutdown_handle = handle.clone();
                tokio::spawn(async move {
                    let _ = shutdown.recv().await;
                    shutdown_handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN));
                });
                axum_server::from_tcp_rustls(listener.into_std()?, rustls)
                    .handle(handle)
                    .serve(app)
                    .await?;
            }
            None => {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown.recv().await;
                    })
                    .await?;
            }
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn gateway_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let ctx = ProxyContext::new(request.headers(), Some(peer), state.runtime.load());
    let method = request.method().clone();

    tracing::debug!(
        request_id = %ctx.request_id,
        method = %method,
        path = %request.uri().path(),
        client_ip = %ctx.client_ip,
        "gateway request"
    );

    let mut response = dispatch(&state, &ctx, request).await;
    finalize(&mut response, &ctx);

    let protocol = response
        .headers()
        .get(X_PROXY_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(if ctx.is_websocket { "websocket" } else { "none" });
    metrics::record_request(method.as_str(), response.status().as_u16(), protocol, ctx.start_time);

    response
}

async fn dispatch(state: &AppState, ctx: &ProxyContext, request: Request<Body>) -> Response {
    let config = &ctx.snapshot.config;

    if is_blocked_agent(request.headers(), &config.security) {
        tracing::info!(request_id = %ctx.request_id, client_ip = %ctx.client_ip, "blocked user agent");
        return GatewayError::Forbidden.into_response();
    }

    let path = request.uri().path();
    if path == "/" {
        return state.status_page.render(ctx);
    }
    if path == "/health" {
        return (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")], "OK").into_response();
    }
    if request.method() == Method::OPTIONS {
        return preflight_response(ctx);
    }

    let Some(target) = resolve_target(path, request.uri().query()) else {
        tracing::debug!(request_id = %ctx.request_id, path = %path, "no target in path");
        return state.status_page.render(ctx);
    };

    if let Err(denied) = ctx.snapshot.policy.check_access(&target.hostname) {
        tracing::warn!(request_id = %ctx.request_id, domain = %denied.domain, reason = %denied.reason, "access denied");
        return GatewayError::from(denied).into_response();
    }

    let resolution = state.negotiator.resolve(&target).await;

    if config.telemetry.enabled {
        record_playback(
            &state.telemetry,
            &target.path,
            &target.hostname,
            &ctx.client_country,
            &ctx.edge_id,
        );
    }

    let (mut parts, body) = request.into_parts();
    let result = if ctx.is_websocket {
        match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => {
                websocket::tunnel(
                    upgrade,
                    &state.negotiator,
                    ctx,
                    &target,
                    resolution,
                    &parts.headers,
                    state.forwarder.forward_timeout(),
                )
                .await
            }
            Err(rejection) => return rejection.into_response(),
        }
    } else {
        state
            .forwarder
            .forward(&state.negotiator, ctx, &target, resolution, parts, body)
            .await
    };

    result.unwrap_or_else(IntoResponse::into_response)
}

/// Gateway identity on every response; CORS on gateway-generated ones too.
fn finalize(response: &mut Response, ctx: &ProxyContext) {
    let headers = response.headers_mut();
    if !headers.contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN) {
        apply_cors(headers, ctx);
    }

    let elapsed_ms = ctx.start_time.elapsed().as_millis();
    headers.insert(X_PROXY_TIME, HeaderValue::from(elapsed_ms as u64));
    if let Ok(edge) = HeaderValue::from_str(&ctx.edge_id) {
        headers.insert(X_PROXY_EDGE, edge);
    }
    headers.insert(
        X_PROXY_VERSION,
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "handler panicked".to_string()
    };
    tracing::error!(panic = %message, "request handler panicked");
    internal_error_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::connect_info::MockConnectInfo;
    use tower::ServiceExt;

    fn test_router(config: GatewayConfig) -> Router {
        HttpServer::new(config, None)
            .unwrap()
            .router()
            .layer(MockConnectInfo(SocketAddr::from(([10, 0, 0, 1], 5000))))
    }

    #[tokio::test]
    async fn health_route_answers_ok() {
        let response = test_router(GatewayConfig::default())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(X_REQUEST_ID));
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn denied_host_never_leaves_the_gateway() {
        let response = test_router(GatewayConfig::default())
            .oneshot(
                Request::get("/https://api.paypal.com/v1/x")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers().get(X_PROXY_EDGE).unwrap(), "local");
    }

    #[tokio::test]
    async fn blocked_agent_gets_plain_forbidden() {
        let mut config = GatewayConfig::default();
        config.security.bot_protection = true;
        let response = test_router(config)
            .oneshot(
                Request::get("/")
                    .header(header::USER_AGENT, "python-requests/2.31")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain"
        );
    }

    #[tokio::test]
    async fn panic_payload_is_not_sent_to_client() {
        let response = handle_panic(Box::new(String::from("secret key at /etc/edge/tls.key")));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["message"], "internal error");
        assert!(!body.to_string().contains("secret"));
    }

    #[test]
    fn finalize_stamps_identity_headers() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("cf-ray", HeaderValue::from_static("8a1b-HKG"));
        let snapshot = Arc::new(crate::config::Snapshot::new(GatewayConfig::default()));
        let ctx = ProxyContext::new(&headers, None, snapshot);

        let mut response = GatewayError::Forbidden.into_response();
        finalize(&mut response, &ctx);

        let headers = response.headers();
        assert!(headers.contains_key(X_PROXY_TIME));
        assert_eq!(headers.get(X_PROXY_EDGE).unwrap(), "8a1b-HKG");
        assert_eq!(headers.get(X_PROXY_VERSION).unwrap(), env!("CARGO_PKG_VERSION"));
        assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
    }
}
