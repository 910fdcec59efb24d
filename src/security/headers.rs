//! Header manipulation for upstream requests and client responses.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers in both directions
//! - Drop edge/forwarding fields supplied by the client (never trusted)
//! - Set Host, X-Forwarded-Proto and, for non-media traffic, X-Real-IP and X-Forwarded-For
//!
//! # Design Decisions
//! - The skip-set comes from config; hop-by-hop fields are always removed on top of it
//! - Media requests do not carry the client IP upstream

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};

use crate::routing::target::Scheme;

/// Hop-by-hop fields (RFC 9110 §7.6.1).
pub const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
];

/// Handshake fields regenerated on each hop of a WebSocket tunnel.
pub const WEBSOCKET_HANDSHAKE: [&str; 6] = [
    "upgrade",
    "connection",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "sec-websocket-accept",
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Remove hop-by-hop fields, including any named by the `Connection` header.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Inputs for building the upstream request headers.
pub struct ForwardedFor<'a> {
    pub hostname: &'a str,
    pub scheme: Scheme,
    pub client_ip: Option<&'a str>,
    pub is_media: bool,
}

/// Build the header set sent upstream.
pub fn build_upstream_headers(
    inbound: &HeaderMap,
    skip: &[String],
    forwarded: &ForwardedFor<'_>,
) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(inbound.len() + 4);
    for (name, value) in inbound {
        if skip.iter().any(|s| s.eq_ignore_ascii_case(name.as_str())) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    strip_hop_by_hop(&mut out);
    // Upgrade is hop-by-hop too, but the WebSocket path regenerates it.
    out.remove(header::UPGRADE);

    if let Ok(host) = HeaderValue::from_str(forwarded.hostname) {
        out.insert(header::HOST, host);
    }
    set_forwarded_proto(&mut out, forwarded.scheme);

    if !forwarded.is_media {
        if let Some(ip) = forwarded.client_ip.filter(|ip| !ip.is_empty()) {
            if let Ok(value) = HeaderValue::from_str(ip) {
                out.insert("x-real-ip", value);
            }
            let chained = match inbound
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.trim().is_empty())
            {
                Some(existing) => format!("{}, {}", existing, ip),
                None => ip.to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&chained) {
                out.insert("x-forwarded-for", value);
            }
        }
    }

    out
}

pub fn set_forwarded_proto(headers: &mut HeaderMap, scheme: Scheme) {
    headers.insert("x-forwarded-proto", HeaderValue::from_static(scheme.as_str()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::HeaderConfig;

    fn inbound() -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(header::HOST, HeaderValue::from_static("edge.example.net"));
        h.insert(header::USER_AGENT, HeaderValue::from_static("Emby/4.8"));
        h.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-custom-hop"));
        h.insert("x-custom-hop", HeaderValue::from_static("1"));
        h.insert("cf-connecting-ip", HeaderValue::from_static("203.0.113.7"));
        h.insert("cf-ray", HeaderValue::from_static("8a1b-HKG"));
        h.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.1"));
        h.insert("cdn-loop", HeaderValue::from_static("cloudflare"));
        h
    }

    #[test]
    fn test_skip_set_and_forwarding_chain() {
        let skip = HeaderConfig::default().skip_request;
        let out = build_upstream_headers(
            &inbound(),
            &skip,
            &ForwardedFor {
                hostname: "media.example.org",
                scheme: Scheme::Https,
                client_ip: Some("203.0.113.7"),
                is_media: false,
            },
        );

        assert_eq!(out.get(header::HOST).unwrap(), "media.example.org");
        assert_eq!(out.get("x-forwarded-proto").unwrap(), "https");
        assert_eq!(out.get("x-real-ip").unwrap(), "203.0.113.7");
        assert_eq!(
            out.get("x-forwarded-for").unwrap(),
            "198.51.100.1, 203.0.113.7"
        );
        assert_eq!(out.get(header::USER_AGENT).unwrap(), "Emby/4.8");
        for gone in ["cf-connecting-ip", "cf-ray", "cdn-loop", "connection", "x-custom-hop"] {
            assert!(out.get(gone).is_none(), "{gone} should be dropped");
        }
    }

    #[test]
    fn test_media_requests_hide_client_ip() {
        let skip = HeaderConfig::default().skip_request;
        let out = build_upstream_headers(
            &inbound(),
            &skip,
            &ForwardedFor {
                hostname: "10.0.0.5",
                scheme: Scheme::Http,
                client_ip: Some("203.0.113.7"),
                is_media: true,
            },
        );
        assert!(out.get("x-real-ip").is_none());
        assert!(out.get("x-forwarded-for").is_none());
        assert_eq!(out.get("x-forwarded-proto").unwrap(), "http");
    }

    #[test]
    fn test_strip_response_hop_by_hop() {
        let mut h = HeaderMap::new();
        h.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        h.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
        strip_hop_by_hop(&mut h);
        assert!(h.get(header::TRANSFER_ENCODING).is_none());
        assert!(h.get(header::CONTENT_TYPE).is_some());
        assert!(is_hop_by_hop(&header::TE));
    }
}
