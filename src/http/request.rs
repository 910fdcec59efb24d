//! Per-request context.
//!
//! # Responsibilities
//! - Capture one config snapshot for the whole request
//! - Extract client metadata supplied by the edge (IP, country, edge id)
//! - Work out the gateway's own public origin for redirect and body rewriting
//!
//! # Design Decisions
//! - The client IP header is trusted only because the edge overwrites it;
//!   without it the peer address is used
//! - `listener.public_origin` wins over Host / X-Forwarded-Proto

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::http::{header, HeaderMap, HeaderValue};

use crate::config::Snapshot;

/// Header carrying the request id set by the request-id layer.
pub const X_REQUEST_ID: &str = "x-request-id";

pub struct ProxyContext {
    pub snapshot: Arc<Snapshot>,
    pub request_id: String,
    pub client_ip: String,
    pub client_country: String,
    pub edge_id: String,
    pub is_websocket: bool,
    /// e.g. `https://edge.example.net`
    pub gateway_origin: String,
    /// `host[:port]` of the gateway
    pub gateway_authority: String,
    pub gateway_hostname: String,
    pub origin: Option<HeaderValue>,
    pub access_control_request_headers: Option<HeaderValue>,
    pub start_time: Instant,
}

impl ProxyContext {
    pub fn new(headers: &HeaderMap, peer: Option<SocketAddr>, snapshot: Arc<Snapshot>) -> Self {
        let start_time = Instant::now();
        let edge = &snapshot.config.edge;

        let client_ip = header_str(headers, &edge.client_ip_header)
            .map(str::to_string)
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string());
        let client_country = header_str(headers, &edge.country_header)
            .unwrap_or("XX")
            .to_string();
        let edge_id = header_str(headers, &edge.edge_id_header)
            .unwrap_or(&edge.node_id)
            .to_string();

        let is_websocket = headers
            .get(header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

        let gateway_origin = match &snapshot.config.listener.public_origin {
            Some(origin) => origin.trim_end_matches('/').to_string(),
            None => {
                let scheme = header_str(headers, "x-forwarded-proto")
                    .filter(|p| p.eq_ignore_ascii_case("https") || p.eq_ignore_ascii_case("http"))
                    .unwrap_or("http")
                    .to_ascii_lowercase();
                let host = header_str(headers, header::HOST.as_str()).unwrap_or("localhost");
                format!("{}://{}", scheme, host)
            }
        };
        let (gateway_authority, gateway_hostname) = split_origin(&gateway_origin);

        Self {
            request_id: header_str(headers, X_REQUEST_ID)
                .unwrap_or("unknown")
                .to_string(),
            client_ip,
            client_country,
            edge_id,
            is_websocket,
            gateway_origin,
            gateway_authority,
            gateway_hostname,
            origin: headers.get(header::ORIGIN).cloned(),
            access_control_request_headers: headers
                .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
                .cloned(),
            snapshot,
            start_time,
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// `(authority, hostname)` of an origin such as `https://edge.example.net:8443`.
fn split_origin(origin: &str) -> (String, String) {
    match url::Url::parse(origin) {
        Ok(url) => {
            let hostname = url
                .host_str()
                .unwrap_or("")
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_ascii_lowercase();
            let authority = match url.port() {
                Some(port) => format!("{}:{}", url.host_str().unwrap_or(""), port),
                None => url.host_str().unwrap_or("").to_string(),
            };
            (authority, hostname)
        }
        Err(_) => {
            let authority = origin
                .split_once("://")
                .map_or(origin, |(_, rest)| rest)
                .to_string();
            let hostname = authority
                .rsplit_once(':')
                .map_or(authority.as_str(), |(h, _)| h)
                .to_ascii_lowercase();
            (authority, hostname)
        }
    }
}
