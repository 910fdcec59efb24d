//! Landing page served on `/` and for paths that name no valid target.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::http::request::ProxyContext;
use crate::security::access_control::PolicySummary;

/// Renders the landing page. Deployments can swap in their own.
pub trait StatusPage: Send + Sync {
    fn render(&self, ctx: &ProxyContext) -> Response;
}

/// Plain HTML page with client metadata and the active policy sizes.
pub struct DefaultStatusPage;

impl StatusPage for DefaultStatusPage {
    fn render(&self, ctx: &ProxyContext) -> Response {
        let summary = ctx.snapshot.policy.summary();
        let html = render_html(
            &ctx.client_ip,
            &ctx.client_country,
            &ctx.edge_id,
            &ctx.gateway_origin,
            &summary,
        );
        (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/html; charset=utf-8"),
                (header::CACHE_CONTROL, "no-store"),
            ],
            html,
        )
            .into_response()
    }
}

fn render_html(
    client_ip: &str,
    country: &str,
    edge_id: &str,
    origin: &str,
    summary: &PolicySummary,
) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>edge-gateway</title></head>
<body>
<h1>edge-gateway</h1>
<p>Usage: <code>{origin}/{{host}}[:port]/{{path}}</code></p>
<table>
<tr><th>Client IP</th><td>{ip}</td></tr>
<tr><th>Country</th><td>{country}</td></tr>
<tr><th>Edge</th><td>{edge}</td></tr>
<tr><th>Whitelist</th><td>{whitelist}</td></tr>
<tr><th>Blocked domains</th><td>{blocked}</td></tr>
<tr><th>Allowed domains</th><td>{allowed}</td></tr>
<tr><th>Direct redirect domains</th><td>{direct}</td></tr>
<tr><th>Auto-proxy patterns</th><td>{auto}</td></tr>
</table>
<p>v{version}</p>
</body>
</html>
"#,
        origin = escape_html(origin),
        ip = escape_html(client_ip),
        country = escape_html(country),
        edge = escape_html(edge_id),
        whitelist = if summary.whitelist_enabled { "on" } else { "off" },
        blocked = summary.blocked,
        allowed = summary.allowed,
        direct = summary.direct_redirect,
        auto = summary.auto_proxy,
        version = env!("CARGO_PKG_VERSION"),
    )
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape() {
        assert_eq!(
            escape_html(r#"<script>"x" & 'y'</script>"#),
            "&lt;script&gt;&quot;x&quot; &amp; &#39;y&#39;&lt;/script&gt;"
        );
    }

    #[test]
    fn test_page_shows_client_and_policy() {
        let summary = PolicySummary {
            whitelist_enabled: false,
            blocked: 3,
            allowed: 0,
            direct_redirect: 2,
            auto_proxy: 4,
        };
        let html = render_html("203.0.113.7", "HK", "8a1b-HKG", "https://edge.example.net", &summary);
        assert!(html.contains("<td>203.0.113.7</td>"));
        assert!(html.contains("<td>HK</td>"));
        assert!(html.contains("<tr><th>Auto-proxy patterns</th><td>4</td></tr>"));
        assert!(html.contains("https://edge.example.net/{host}[:port]/{path}"));
    }
}
