//! Upstream request forwarding.
//!
//! # Retry Protocol
//! ```text
//! send over resolved scheme
//!     ok, status not in TLS-interception set    → process response
//!     transport error / timeout / TLS status
//!         and resolution downgradable           → downgrade, X-Forwarded-Proto: http,
//!                                                 send once more over http
//!         otherwise                             → 502 (sanitized detail)
//! ```
//!
//! # Design Decisions
//! - Redirects are never followed; the response processor rewrites them
//! - The timeout covers connect and response headers, never body streaming
//! - Request bodies are buffered only when a retry is possible, otherwise streamed
//! - Content decoding is left to the client: `Accept-Encoding` is negotiated by
//!   reqwest and bodies arrive decoded

use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::header::{self, HeaderMap};
use axum::http::request::Parts;
use axum::http::Method;
use axum::response::Response;
use futures_util::StreamExt;
use thiserror::Error;

use crate::config::schema::TimeoutConfig;
use crate::error::GatewayError;
use crate::http::request::ProxyContext;
use crate::http::response::{is_media, process_response, Exchange};
use crate::negotiation::{ProtocolNegotiator, Resolution};
use crate::routing::target::{Scheme, TargetSpec};
use crate::security::headers::{build_upstream_headers, set_forwarded_proto, ForwardedFor};

/// Why a single upstream attempt failed.
#[derive(Debug, Error)]
enum SendError {
    #[error("no response headers within the forward timeout")]
    Timeout,

    #[error("connect failed: {0}")]
    Connect(reqwest::Error),

    #[error("request failed: {0}")]
    Request(reqwest::Error),
}

impl SendError {
    /// Client-safe description; internals only go to the log.
    fn detail(&self) -> &'static str {
        match self {
            SendError::Timeout => "upstream timed out",
            SendError::Connect(_) => "upstream connection failed",
            SendError::Request(_) => "upstream request failed",
        }
    }
}

impl From<reqwest::Error> for SendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SendError::Timeout
        } else if e.is_connect() {
            SendError::Connect(e)
        } else {
            SendError::Request(e)
        }
    }
}

enum Payload {
    Empty,
    Buffered(Bytes),
    Streaming(Option<Body>),
}

impl Payload {
    fn next_body(&mut self) -> Option<reqwest::Body> {
        match self {
            Payload::Empty => None,
            Payload::Buffered(bytes) => Some(reqwest::Body::from(bytes.clone())),
            Payload::Streaming(body) => body
                .take()
                .map(|b| reqwest::Body::wrap_stream(b.into_data_stream())),
        }
    }
}

/// Outbound HTTP client shared by all requests.
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    forward_timeout: Duration,
}

impl Forwarder {
    pub fn new(timeouts: &TimeoutConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(timeouts.connect_secs))
            .build()?;
        Ok(Self {
            client,
            forward_timeout: Duration::from_secs(timeouts.forward_secs),
        })
    }

    pub fn forward_timeout(&self) -> Duration {
        self.forward_timeout
    }

    /// Forward an HTTP request to the target and process the response.
    pub async fn forward(
        &self,
        negotiator: &ProtocolNegotiator,
        ctx: &ProxyContext,
        target: &TargetSpec,
        resolution: Resolution,
        parts: Parts,
        body: Body,
    ) -> Result<Response, GatewayError> {
        let config = &ctx.snapshot.config;
        let method = parts.method;
        let media = is_media(&target.path, &parts.headers, &config.media);

        let mut headers = build_upstream_headers(
            &parts.headers,
            &config.headers.skip_request,
            &ForwardedFor {
                hostname: &target.hostname,
                scheme: resolution.scheme,
                client_ip: Some(&ctx.client_ip),
                is_media: media,
            },
        );
        headers.remove(header::ACCEPT_ENCODING);

        let sends_body = matches!(method, Method::POST | Method::PUT | Method::PATCH);
        if !sends_body {
            headers.remove(header::CONTENT_LENGTH);
        }

        let can_retry = resolution.downgradable();
        let mut payload = if !sends_body {
            Payload::Empty
        } else if can_retry {
            Payload::Buffered(read_body(body, config.security.max_request_body_bytes).await?)
        } else {
            Payload::Streaming(Some(body))
        };

        let first = self
            .send(&method, target.url(resolution.scheme), headers.clone(), payload.next_body())
            .await;

        let first_status = first.as_ref().ok().map(|r| r.status().as_u16());
        let retry = retries_over_http(
            first_status,
            &resolution,
            &config.negotiation.tls_interception_statuses,
        );

        let (upstream, scheme) = if !retry {
            match first {
                Ok(response) => (response, resolution.scheme),
                Err(e) => {
                    tracing::warn!(request_id = %ctx.request_id, target = %target.authority(), error = %e, "upstream request failed");
                    return Err(GatewayError::upstream(e.detail()));
                }
            }
        } else {
            match &first {
                Ok(response) => tracing::info!(
                    request_id = %ctx.request_id,
                    target = %target.authority(),
                    status = %response.status(),
                    "TLS origin failure, retrying over http"
                ),
                Err(e) => tracing::info!(
                    request_id = %ctx.request_id,
                    target = %target.authority(),
                    error = %e,
                    "https attempt failed, retrying over http"
                ),
            }
            drop(first);

            negotiator.downgrade(target);
            set_forwarded_proto(&mut headers, Scheme::Http);
            match self
                .send(&method, target.url(Scheme::Http), headers, payload.next_body())
                .await
            {
                Ok(response) => (response, Scheme::Http),
                Err(e) => {
                    tracing::warn!(request_id = %ctx.request_id, target = %target.authority(), error = %e, "http retry failed");
                    return Err(GatewayError::upstream(e.detail()));
                }
            }
        };

        tracing::debug!(
            request_id = %ctx.request_id,
            status = %upstream.status(),
            scheme = %scheme,
            "upstream responded"
        );

        process_response(
            upstream,
            &Exchange {
                ctx,
                target,
                scheme,
                method: &method,
                is_media: media,
            },
        )
        .await
    }

    async fn send(
        &self,
        method: &Method,
        url: String,
        headers: HeaderMap,
        body: Option<reqwest::Body>,
    ) -> Result<reqwest::Response, SendError> {
        let mut request = self.client.request(method.clone(), url).headers(headers);
        if let Some(body) = body {
            request = request.body(body);
        }

        match tokio::time::timeout(self.forward_timeout, request.send()).await {
            Ok(result) => result.map_err(SendError::from),
            Err(_) => Err(SendError::Timeout),
        }
    }
}

/// Whether a first attempt should be repeated over http. `status` is `None`
/// when the attempt produced no response at all.
fn retries_over_http(status: Option<u16>, resolution: &Resolution, tls_statuses: &[u16]) -> bool {
    resolution.downgradable() && status.map_or(true, |s| tls_statuses.contains(&s))
}

/// Buffer a request body, refusing anything larger than `limit`.
async fn read_body(body: Body, limit: usize) -> Result<Bytes, GatewayError> {
    let mut stream = body.into_data_stream();
    let mut buf = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| GatewayError::Internal(format!("failed to read request body: {e}")))?;
        if buf.len() + chunk.len() > limit {
            return Err(GatewayError::PayloadTooLarge { limit });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::ResolutionSource;

    #[tokio::test]
    async fn read_body_enforces_limit() {
        let ok = read_body(Body::from("hello"), 5).await.unwrap();
        assert_eq!(&ok[..], b"hello");

        let err = read_body(Body::from("hello!"), 5).await.unwrap_err();
        assert!(matches!(err, GatewayError::PayloadTooLarge { limit: 5 }));
    }

    #[test]
    fn buffered_payload_replays() {
        let mut payload = Payload::Buffered(Bytes::from_static(b"{}"));
        assert!(payload.next_body().is_some());
        assert!(payload.next_body().is_some());

        let mut streaming = Payload::Streaming(Some(Body::from("x")));
        assert!(streaming.next_body().is_some());
        assert!(streaming.next_body().is_none());
        assert!(Payload::Empty.next_body().is_none());
    }

    #[test]
    fn details_are_sanitized() {
        assert_eq!(SendError::Timeout.detail(), "upstream timed out");
        assert_eq!(
            SendError::Timeout.to_string(),
            "no response headers within the forward timeout"
        );
    }

    fn https_from(source: ResolutionSource) -> Resolution {
        Resolution {
            scheme: Scheme::Https,
            source,
        }
    }

    #[test]
    fn tls_interception_status_triggers_retry() {
        let statuses = [525, 526, 527, 530];
        for source in [ResolutionSource::WellKnownPort, ResolutionSource::Probe, ResolutionSource::Store] {
            let resolution = https_from(source);
            assert!(retries_over_http(Some(525), &resolution, &statuses), "{source}");
            assert!(retries_over_http(None, &resolution, &statuses), "{source}");
            assert!(!retries_over_http(Some(200), &resolution, &statuses), "{source}");
            assert!(!retries_over_http(Some(502), &resolution, &statuses), "{source}");
        }
    }

    #[test]
    fn forced_or_plain_schemes_never_retry() {
        let statuses = [525, 526, 527, 530];
        let hinted = https_from(ResolutionSource::Hint);
        assert!(!retries_over_http(Some(525), &hinted, &statuses));
        assert!(!retries_over_http(None, &hinted, &statuses));

        let plain = Resolution {
            scheme: Scheme::Http,
            source: ResolutionSource::Probe,
        };
        assert!(!retries_over_http(Some(525), &plain, &statuses));
        assert!(!retries_over_http(None, &plain, &statuses));
    }
}
