//! Path-encoded upstream target resolution.
//!
//! # Path Convention
//! ```text
//! /{hint}{host}[:port]/{path}?{query}
//!
//!   hint := "https://" | "http://" | "https/" | "http/"   (optional)
//!   host := hostname | "[" ipv6 "]"
//! ```
//!
//! # Design Decisions
//! - Pure and deterministic: no DNS, no I/O
//! - An unparsable path is not an error, the caller falls back to the status page
//! - A malformed port is folded back into the hostname, which then fails validation

use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Upstream protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    /// The matching WebSocket scheme.
    pub fn ws_str(&self) -> &'static str {
        match self {
            Scheme::Http => "ws",
            Scheme::Https => "wss",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("http") {
            Ok(Scheme::Http)
        } else if s.eq_ignore_ascii_case("https") {
            Ok(Scheme::Https)
        } else {
            Err(())
        }
    }
}

/// A resolved upstream target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    /// Protocol forced by the request path, if any.
    pub explicit_protocol: Option<Scheme>,
    /// Host part exactly as it appeared in the path.
    pub host_port: String,
    /// Lowercased hostname without brackets or port.
    pub hostname: String,
    pub port: Option<u16>,
    /// Upstream path, always starting with `/`.
    pub path: String,
    /// Query string including the leading `?`, or empty.
    pub query: String,
    /// `path` followed by `query`.
    pub full_path: String,
}

impl TargetSpec {
    /// `host[:port]` suitable for a URL authority (IPv6 literals bracketed).
    pub fn authority(&self) -> String {
        let host = if self.hostname.contains(':') {
            format!("[{}]", self.hostname)
        } else {
            self.hostname.clone()
        };
        match self.port {
            Some(port) => format!("{}:{}", host, port),
            None => host,
        }
    }

    /// Absolute upstream URL for the given scheme.
    pub fn url(&self, scheme: Scheme) -> String {
        format!("{}://{}{}", scheme, self.authority(), self.full_path)
    }

    /// Absolute upstream WebSocket URL for the given scheme.
    pub fn ws_url(&self, scheme: Scheme) -> String {
        format!("{}://{}{}", scheme.ws_str(), self.authority(), self.full_path)
    }

    /// Protocol cache key: `hostname:port` or `hostname:default`.
    pub fn cache_key(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.hostname, port),
            None => format!("{}:default", self.hostname),
        }
    }
}

const PROTOCOL_HINTS: [(&str, Scheme); 4] = [
    ("https://", Scheme::Https),
    ("http://", Scheme::Http),
    ("https/", Scheme::Https),
    ("http/", Scheme::Http),
];

/// Resolve a request path and query into an upstream target.
///
/// `query` may be given with or without its leading `?`.
pub fn resolve_target(path: &str, query: Option<&str>) -> Option<TargetSpec> {
    let mut rest = path.strip_prefix('/').unwrap_or(path);
    if rest.is_empty() {
        return None;
    }

    let mut explicit_protocol = None;
    for (prefix, scheme) in PROTOCOL_HINTS {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            explicit_protocol = Some(scheme);
            rest = stripped;
            break;
        }
    }

    let (host_port, upstream_path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };

    let (hostname, port) = split_host_port(host_port)?;
    if !is_valid_hostname(&hostname) {
        return None;
    }

    let query = match query {
        Some(q) if !q.is_empty() && q != "?" => {
            if q.starts_with('?') {
                q.to_string()
            } else {
                format!("?{}", q)
            }
        }
        _ => String::new(),
    };

    Some(TargetSpec {
        explicit_protocol,
        host_port: host_port.to_string(),
        hostname: hostname.to_ascii_lowercase(),
        port,
        path: upstream_path.to_string(),
        full_path: format!("{}{}", upstream_path, query),
        query,
    })
}

fn split_host_port(host_port: &str) -> Option<(String, Option<u16>)> {
    if host_port.is_empty() {
        return None;
    }

    if let Some(inner) = host_port.strip_prefix('[') {
        let close = inner.find(']')?;
        let hostname = &inner[..close];
        let after = &inner[close + 1..];
        if after.is_empty() {
            return Some((hostname.to_string(), None));
        }
        let port_str = after.strip_prefix(':')?;
        return parse_port(port_str).map(|p| (hostname.to_string(), Some(p)));
    }

    match host_port.matches(':').count() {
        0 => Some((host_port.to_string(), None)),
        1 => {
            let (host, port_str) = host_port.split_once(':')?;
            match parse_port(port_str) {
                Some(port) if !host.is_empty() => Some((host.to_string(), Some(port))),
                _ => Some((host_port.to_string(), None)),
            }
        }
        // Bare IPv6 literal, no port possible without brackets.
        _ => Some((host_port.to_string(), None)),
    }
}

fn parse_port(s: &str) -> Option<u16> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match s.parse::<u32>() {
        Ok(p) if (1..=65_535).contains(&p) => Some(p as u16),
        _ => None,
    }
}

/// Validate a hostname as an IPv4 literal, an IPv6 literal or a DNS name.
pub fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    if host.contains(':') {
        return Ipv6Addr::from_str(host).is_ok();
    }
    if is_dotted_quad_shape(host) {
        return host
            .split('.')
            .all(|octet| octet.parse::<u16>().map(|n| n <= 255).unwrap_or(false));
    }
    host.split('.').all(is_valid_label)
}

fn is_dotted_quad_shape(host: &str) -> bool {
    let parts: Vec<&str> = host.split('.').collect();
    parts.len() == 4
        && parts
            .iter()
            .all(|p| (1..=3).contains(&p.len()) && p.bytes().all(|b| b.is_ascii_digit()))
}

fn is_valid_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 {
        return false;
    }
    let edge_ok = |b: u8| b.is_ascii_alphanumeric();
    edge_ok(bytes[0])
        && edge_ok(bytes[bytes.len() - 1])
        && bytes.iter().all(|&b| b.is_ascii_alphanumeric() || b == b'-')
}
