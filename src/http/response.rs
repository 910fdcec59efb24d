//! Response handling and transformation.
//!
//! # Responsibilities
//! - Classify the exchange (media API, streamed content)
//! - Filter upstream headers and add CORS plus diagnostic headers
//! - Rewrite redirect targets so they stay on the gateway
//! - Rewrite links in bounded text bodies, stream everything else untouched
//!
//! # Data Flow
//! ```text
//! upstream response
//!     → redirect?          → Location rewritten, body dropped
//!     → rewritable?        → decided from headers only
//!         yes → buffer ≤ max_body_bytes → rewrite_body → new body
//!               (over the bound: replay buffered chunks + rest of stream)
//!         no  → stream body through
//!     → header policy + CORS + X-Proxy-* diagnostics
//! ```

use axum::body::{Body, Bytes};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::response::Response;
use futures_util::{stream, StreamExt};

use crate::config::schema::{MediaConfig, RewriteConfig};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::http::request::ProxyContext;
use crate::http::rewrite::{rewrite_body, RewriteScope};
use crate::observability::metrics;
use crate::routing::target::{Scheme, TargetSpec};
use crate::security::headers::strip_hop_by_hop;

pub const X_PROXY_PROTOCOL: &str = "x-proxy-protocol";
pub const X_PROXY_TARGET: &str = "x-proxy-target";
pub const X_PROXY_REWRITE: &str = "x-proxy-rewrite";
pub const X_PROXY_REWRITE_ERROR: &str = "x-proxy-rewrite-error";

const ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, PATCH, HEAD, OPTIONS";
const EXPOSE_HEADERS: &str =
    "Content-Length, Content-Range, Accept-Ranges, X-Proxy-Protocol, X-Proxy-Target, X-Proxy-Rewrite";

const REDIRECT_STATUSES: [u16; 5] = [301, 302, 303, 307, 308];

/// Media API call: a known media path fragment or a media client auth header.
pub fn is_media(path: &str, headers: &HeaderMap, media: &MediaConfig) -> bool {
    media.path_patterns.iter().any(|p| path.contains(p.as_str()))
        || media.auth_headers.iter().any(|h| headers.contains_key(h.as_str()))
}

/// Streamed content judged from the path alone.
pub fn is_stream_path(path: &str, media: &MediaConfig) -> bool {
    let lower = path.to_ascii_lowercase();
    media
        .stream_patterns
        .iter()
        .any(|p| lower.contains(&p.to_ascii_lowercase()))
}

fn media_type(headers: &HeaderMap) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

fn is_av_content(media_type: &str) -> bool {
    media_type.starts_with("video/") || media_type.starts_with("audio/")
}

fn is_rewritable_type(media_type: &str, config: &RewriteConfig) -> bool {
    !media_type.is_empty()
        && config
            .content_types
            .iter()
            .any(|allowed| media_type.starts_with(&allowed.to_ascii_lowercase()))
}

/// Bodies up to and including `limit` bytes are buffered for rewriting.
fn within_rewrite_bound(len: u64, limit: usize) -> bool {
    len <= limit as u64
}

/// Everything about the exchange the processor needs besides the upstream response.
pub struct Exchange<'a> {
    pub ctx: &'a ProxyContext,
    pub target: &'a TargetSpec,
    pub scheme: Scheme,
    pub method: &'a Method,
    pub is_media: bool,
}

pub async fn process_response(
    upstream: reqwest::Response,
    exchange: &Exchange<'_>,
) -> Result<Response, GatewayError> {
    let status = upstream.status();
    let config = &exchange.ctx.snapshot.config;

    if REDIRECT_STATUSES.contains(&status.as_u16()) {
        if let Some(location) = rewrite_location(upstream.headers(), exchange) {
            let mut headers = filtered_headers(upstream.headers(), exchange.is_media, false, config);
            headers.insert(header::LOCATION, location);
            headers.remove(header::CONTENT_LENGTH);
            headers.remove(header::CONTENT_ENCODING);
            apply_proxy_headers(&mut headers, exchange);
            return Ok(build(status, headers, Body::empty()));
        }
    }

    let media_type = media_type(upstream.headers());
    let is_stream =
        is_stream_path(&exchange.target.path, &config.media) || is_av_content(&media_type);

    let mut headers = filtered_headers(upstream.headers(), exchange.is_media, is_stream, config);
    apply_proxy_headers(&mut headers, exchange);

    let declared_len = upstream
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let should_rewrite = config.rewrite.enabled
        && !is_stream
        && *exchange.method != Method::HEAD
        && is_rewritable_type(&media_type, &config.rewrite)
        && declared_len.map_or(true, |len| within_rewrite_bound(len, config.rewrite.max_body_bytes));

    if !should_rewrite {
        return Ok(build(status, headers, Body::from_stream(upstream.bytes_stream())));
    }

    let limit = config.rewrite.max_body_bytes;
    let mut body_stream = Box::pin(upstream.bytes_stream());
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut total = 0usize;

    while let Some(chunk) = body_stream.next().await {
        let chunk = chunk.map_err(|e| {
            tracing::warn!(request_id = %exchange.ctx.request_id, error = %e, "upstream body failed while buffering");
            GatewayError::upstream("upstream request failed")
        })?;
        total += chunk.len();
        chunks.push(chunk);

        if !within_rewrite_bound(total as u64, limit) {
            tracing::debug!(request_id = %exchange.ctx.request_id, limit, "body over rewrite bound, streaming through");
            metrics::record_rewrite("too_large");
            set_header(&mut headers, X_PROXY_REWRITE_ERROR, "Response too large for rewrite");
            let replay = stream::iter(chunks.into_iter().map(Ok::<Bytes, reqwest::Error>));
            let body = Body::from_stream(replay.chain(body_stream));
            return Ok(build(status, headers, body));
        }
    }

    let bytes = concat(chunks, total);
    let text = match std::str::from_utf8(&bytes) {
        Ok(text) => text,
        Err(_) => {
            metrics::record_rewrite("not_utf8");
            set_header(&mut headers, X_PROXY_REWRITE_ERROR, "Response is not valid UTF-8");
            return Ok(build(status, headers, Body::from(bytes)));
        }
    };

    let ctx = exchange.ctx;
    let scope = RewriteScope {
        target_host: &exchange.target.hostname,
        gateway_origin: &ctx.gateway_origin,
        gateway_authority: &ctx.gateway_authority,
        gateway_hostname: &ctx.gateway_hostname,
        policy: &ctx.snapshot.policy,
    };
    let result = rewrite_body(text, &scope);

    if !result.changed() {
        metrics::record_rewrite("unchanged");
        return Ok(build(status, headers, Body::from(bytes)));
    }

    tracing::info!(
        request_id = %ctx.request_id,
        domains = ?result.rewritten_domains,
        "rewrote response links"
    );
    metrics::record_rewrite("rewritten");

    headers.remove(header::CONTENT_ENCODING);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(result.body.len()));
    set_header(&mut headers, X_PROXY_REWRITE, "true");
    Ok(build(status, headers, Body::from(result.body)))
}

/// Location for a redirect response, or `None` to process it as a plain response.
fn rewrite_location(headers: &HeaderMap, exchange: &Exchange<'_>) -> Option<HeaderValue> {
    let raw = headers.get(header::LOCATION)?.to_str().ok()?;
    let base = url::Url::parse(&exchange.target.url(exchange.scheme)).ok()?;
    let resolved = match base.join(raw) {
        Ok(url) => url,
        Err(e) => {
            tracing::debug!(location = %raw, error = %e, "unparsable redirect location");
            return None;
        }
    };

    let host = resolved
        .host_str()?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    let policy = &exchange.ctx.snapshot.policy;
    let keep_direct = !matches!(resolved.scheme(), "http" | "https")
        || policy.is_direct_domain(&host)
        || policy.is_denied(&host);

    let location = if keep_direct {
        resolved.to_string()
    } else {
        proxy_url(&exchange.ctx.gateway_origin, &resolved)
    };
    HeaderValue::from_str(&location).ok()
}

/// `{gateway_origin}/{scheme}://{host[:port]}{path}{?query}`
pub fn proxy_url(gateway_origin: &str, url: &url::Url) -> String {
    let host = url.host_str().unwrap_or_default();
    let authority = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    let query = url.query().map(|q| format!("?{}", q)).unwrap_or_default();
    format!(
        "{}/{}://{}{}{}",
        gateway_origin,
        url.scheme(),
        authority,
        url.path(),
        query
    )
}

fn filtered_headers(
    upstream: &HeaderMap,
    is_media: bool,
    is_stream: bool,
    config: &GatewayConfig,
) -> HeaderMap {
    let mut headers = upstream.clone();
    strip_hop_by_hop(&mut headers);

    if is_media || is_stream {
        headers.remove(header::CONTENT_SECURITY_POLICY);
        if !headers.contains_key(header::ACCEPT_RANGES) {
            headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        }
    } else {
        for name in &config.headers.remove_response {
            headers.remove(name.as_str());
        }
    }
    headers
}

fn apply_proxy_headers(headers: &mut HeaderMap, exchange: &Exchange<'_>) {
    apply_cors(headers, exchange.ctx);
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static(EXPOSE_HEADERS),
    );
    headers.insert(
        X_PROXY_PROTOCOL,
        HeaderValue::from_static(exchange.scheme.as_str()),
    );
    set_header(headers, X_PROXY_TARGET, &exchange.target.hostname);
}

/// CORS headers shared by proxied responses and preflight answers.
pub fn apply_cors(headers: &mut HeaderMap, ctx: &ProxyContext) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        ctx.origin.clone().unwrap_or(HeaderValue::from_static("*")),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        ctx.access_control_request_headers
            .clone()
            .unwrap_or(HeaderValue::from_static("*")),
    );
}

/// 204 answer to an `OPTIONS` request.
pub fn preflight_response(ctx: &ProxyContext) -> Response {
    let mut headers = HeaderMap::new();
    apply_cors(&mut headers, ctx);
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
    build(StatusCode::NO_CONTENT, headers, Body::empty())
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

fn concat(chunks: Vec<Bytes>, total: usize) -> Bytes {
    match chunks.len() {
        0 => Bytes::new(),
        1 => chunks.into_iter().next().unwrap_or_default(),
        _ => {
            let mut buf = Vec::with_capacity(total);
            for chunk in chunks {
                buf.extend_from_slice(&chunk);
            }
            Bytes::from(buf)
        }
    }
}

fn build(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
