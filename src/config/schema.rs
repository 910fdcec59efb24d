//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files, and
//! every section falls back to defaults so a minimal (or missing) file works.

use serde::{Deserialize, Serialize};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address, TLS, public origin).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Protocol negotiation and protocol cache settings.
    pub negotiation: NegotiationConfig,

    /// Upstream domain policy.
    pub access: AccessConfig,

    /// In-body URL rewriting.
    pub rewrite: RewriteConfig,

    /// Media request classification.
    pub media: MediaConfig,

    /// Request/response header filtering.
    pub headers: HeaderConfig,

    /// Bot protection and request limits.
    pub security: SecurityConfig,

    /// Edge-supplied client metadata.
    pub edge: EdgeConfig,

    /// Key-value store backing the persistent protocol cache and list overrides.
    pub store: StoreConfig,

    /// Remote override refresh.
    pub remote: RemoteConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Usage telemetry.
    pub telemetry: TelemetryConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Public origin of the gateway (e.g., "https://edge.example.net").
    /// Derived from the request's Host header when unset.
    pub public_origin: Option<String>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            tls: None,
            public_origin: None,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upstream connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Time allowed for an upstream to return response headers, in seconds.
    pub forward_secs: u64,

    /// Overall handler timeout (until response headers are sent) in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 10,
            forward_secs: 30,
            request_secs: 60,
        }
    }
}

/// Protocol negotiation configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct NegotiationConfig {
    /// How long a negotiated protocol stays valid, in seconds.
    pub protocol_cache_ttl_secs: u64,

    /// HTTPS probe timeout in milliseconds.
    pub probe_timeout_ms: u64,

    /// Maximum entries held by the in-process protocol cache.
    pub cache_capacity: usize,

    /// Upstream statuses that indicate a failed TLS origin connection.
    pub tls_interception_statuses: Vec<u16>,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            protocol_cache_ttl_secs: 86_400,
            probe_timeout_ms: 5_000,
            cache_capacity: 1_000,
            tls_interception_statuses: vec![525, 526, 527, 530],
        }
    }
}

/// Upstream domain policy.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AccessConfig {
    /// Only allow upstreams listed in `allowed_upstreams`.
    pub whitelist_enabled: bool,

    /// Domains (and their subdomains) that are never proxied.
    pub blocked_upstreams: Vec<String>,

    /// Whitelist entries. A leading `.` means "subdomains only" (plus the bare domain).
    pub allowed_upstreams: Vec<String>,

    /// Domains clients must always reach directly.
    pub direct_redirect_domains: Vec<String>,

    /// Glob patterns of backend hosts that join a proxied session automatically.
    pub auto_proxy_patterns: Vec<String>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            whitelist_enabled: false,
            blocked_upstreams: strings(&[
                "google.com",
                "googleapis.com",
                "gstatic.com",
                "facebook.com",
                "twitter.com",
                "x.com",
                "paypal.com",
                "stripe.com",
                "alipay.com",
                "cloudflare.com",
                "amazonaws.com",
                "azure.com",
            ]),
            allowed_upstreams: Vec::new(),
            direct_redirect_domains: strings(&[
                "quark.cn",
                "uc.cn",
                "115.com",
                "115cdn.com",
                "115cdn.net",
                "aliyundrive.com",
                "aliyundrive.net",
                "189.cn",
                "ctyunxs.cn",
                "mini189.cn",
                "telecomjs.com",
                "xunlei.com",
                "voicehub.top",
                "xiaoya.pro",
            ]),
            auto_proxy_patterns: strings(&[
                "*.sharepoint.cn",
                "*.sharepoint.com",
                "*.emosstore.sbs",
                "*.onedrive.com",
                "*.blob.core.windows.net",
                "*.blob.core.chinacloudapi.cn",
            ]),
        }
    }
}

/// In-body URL rewriting configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RewriteConfig {
    /// Enable redirect-chasing into auto-proxy hosts and body rewriting.
    pub enabled: bool,

    /// Largest body (in bytes) that is buffered for rewriting.
    pub max_body_bytes: usize,

    /// Content types eligible for rewriting (prefix match on the media type).
    pub content_types: Vec<String>,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_body_bytes: 10 * 1024 * 1024, // 10MB
            content_types: strings(&[
                "text/html",
                "application/json",
                "application/javascript",
                "text/javascript",
                "application/xml",
                "text/xml",
                "application/x-mpegurl",
                "application/vnd.apple.mpegurl",
            ]),
        }
    }
}

/// Media request classification.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct MediaConfig {
    /// Path fragments of media-server APIs.
    pub path_patterns: Vec<String>,

    /// Headers sent by media clients.
    pub auth_headers: Vec<String>,

    /// Path fragments / extensions of streamed content (case-insensitive).
    pub stream_patterns: Vec<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            path_patterns: strings(&[
                "/emby/",
                "/jellyfin/",
                "/mediabrowser/",
                "/Videos/",
                "/Audio/",
                "/Items/",
                "/Users/",
                "/Sessions/",
                "/System/",
                "/Library/",
                "/PlaybackInfo",
                "/Playing",
                "/socket",
                "/embywebsocket",
            ]),
            auth_headers: strings(&["x-emby-authorization", "x-mediabrowser-token"]),
            stream_patterns: strings(&[
                "/stream", ".m3u8", ".ts", ".mp4", ".mkv", ".webm", ".mp3", ".flac", ".aac", ".wav",
            ]),
        }
    }
}

/// Header filtering configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HeaderConfig {
    /// Inbound headers never forwarded upstream (edge, forwarding and loop fields).
    /// Hop-by-hop headers are always dropped in addition to these.
    pub skip_request: Vec<String>,

    /// Response headers removed from non-media responses.
    pub remove_response: Vec<String>,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            skip_request: strings(&[
                "host",
                "cf-connecting-ip",
                "cf-ipcountry",
                "cf-ray",
                "cf-visitor",
                "cf-ew-via",
                "cdn-loop",
                "cf-worker",
                "x-forwarded-for",
                "x-forwarded-proto",
                "x-forwarded-host",
                "x-real-ip",
                "forwarded",
            ]),
            remove_response: strings(&[
                "content-security-policy",
                "content-security-policy-report-only",
                "x-frame-options",
            ]),
        }
    }
}

/// Security configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Reject requests from known automation user agents.
    pub bot_protection: bool,

    /// With bot protection on, also reject requests without a User-Agent.
    pub block_empty_user_agent: bool,

    /// Case-insensitive user agent fragments rejected by bot protection.
    pub blocked_user_agents: Vec<String>,

    /// Largest request body buffered for a downgrade retry, in bytes.
    pub max_request_body_bytes: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            bot_protection: false,
            block_empty_user_agent: false,
            blocked_user_agents: strings(&[
                "curl",
                "wget",
                "python",
                "scrapy",
                "bot",
                "spider",
                "crawler",
                "go-http-client",
            ]),
            max_request_body_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Edge metadata configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EdgeConfig {
    /// Header carrying the real client IP. Falls back to the peer address.
    pub client_ip_header: String,

    /// Header carrying the client's country code.
    pub country_header: String,

    /// Header identifying the edge location.
    pub edge_id_header: String,

    /// Edge id used when the header is absent.
    pub node_id: String,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            client_ip_header: "cf-connecting-ip".to_string(),
            country_header: "cf-ipcountry".to_string(),
            edge_id_header: "cf-ray".to_string(),
            node_id: "local".to_string(),
        }
    }
}

/// Key-value store backend selection.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local map, lost on restart.
    Memory,
    /// JSON file on disk.
    File,
    /// No store: protocol decisions live only in memory, no remote overrides.
    None,
}

/// Key-value store configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// File path for the `file` backend.
    pub path: String,

    /// Bound on background store writes, in milliseconds.
    pub write_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: "gateway-store.json".to_string(),
            write_timeout_ms: 2_000,
        }
    }
}

/// Remote override refresh configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RemoteConfig {
    /// How often list overrides are re-read from the store, in seconds.
    pub refresh_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self { refresh_secs: 300 }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Usage telemetry configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Emit playback events to the log sink.
    pub enabled: bool,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: GatewayConfig = toml::from_str("").unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.negotiation.cache_capacity, 1_000);
        assert_eq!(config.rewrite.max_body_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [access]
            whitelist_enabled = true
            allowed_upstreams = [".example.com"]

            [store]
            backend = "none"
            "#,
        )
        .unwrap();

        assert!(config.access.whitelist_enabled);
        assert_eq!(config.access.allowed_upstreams, vec![".example.com"]);
        assert!(config.access.blocked_upstreams.contains(&"google.com".to_string()));
        assert_eq!(config.store.backend, StoreBackend::None);
        assert_eq!(config.store.write_timeout_ms, 2_000);
    }
}
