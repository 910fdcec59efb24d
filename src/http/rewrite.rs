//! In-body URL rewriting.
//!
//! Links in HTML, JSON, scripts and playlists that point at hosts belonging
//! to the same proxied session are turned into gateway URLs, so the client
//! keeps talking to the gateway instead of the backend.
//!
//! # URL Shapes
//! ```text
//! escaped            https:\/\/cdn.example.org\/a.js   (JSON string escaping)
//! absolute           https://cdn.example.org/a.js
//! protocol-relative  "//cdn.example.org/a.js"          (after a quote or whitespace)
//! ```
//!
//! # Design Decisions
//! - One alternation regex, one pass: every occurrence is considered exactly once,
//!   so the shapes cannot rewrite each other's output
//! - Pure function over decoded text; size bounds are enforced by the caller
//! - Escaping style of the match is kept in the replacement

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::security::AccessPolicy;

const HOST: &str = r"[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)*";

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let pattern = format!(
            concat!(
                r"(?i)",
                r#"(?P<esc>https?:\\/\\/(?P<esc_host>{host})(?::\d+)?(?:\\/[^"'\s\\<>]*)*)"#,
                r#"|(?P<abs>https?://(?P<abs_host>{host})(?::\d+)?(?:/[^"'\s<>\\]*)?)"#,
                r#"|(?P<pr_prefix>["'\s])//(?P<pr_rest>(?P<pr_host>{host})(?::\d+)?(?:/[^"'\s<>\\]*)?)"#,
            ),
            host = HOST
        );
        Regex::new(&pattern).expect("url rewrite pattern is valid")
    })
}

/// Everything the engine needs to know about the current request.
pub struct RewriteScope<'a> {
    /// Lowercased hostname of the proxied target.
    pub target_host: &'a str,
    /// Gateway origin, e.g. `https://edge.example.net`.
    pub gateway_origin: &'a str,
    /// Gateway `host[:port]`.
    pub gateway_authority: &'a str,
    /// Gateway hostname without port.
    pub gateway_hostname: &'a str,
    pub policy: &'a AccessPolicy,
}

impl RewriteScope<'_> {
    /// Whether a URL on `host` should be routed through the gateway.
    fn should_proxy(&self, host: &str) -> bool {
        if host == self.target_host || host.eq_ignore_ascii_case(self.gateway_hostname) {
            return false;
        }
        if self.policy.is_direct_domain(host) || self.policy.is_denied(host) {
            return false;
        }
        self.policy.is_auto_proxy_domain(host) || shares_registrable_root(host, self.target_host)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteResult {
    pub body: String,
    pub rewritten_domains: BTreeSet<String>,
}

impl RewriteResult {
    pub fn changed(&self) -> bool {
        !self.rewritten_domains.is_empty()
    }
}

pub fn rewrite_body(text: &str, scope: &RewriteScope<'_>) -> RewriteResult {
    let mut rewritten_domains = BTreeSet::new();

    let body = url_regex()
        .replace_all(text, |caps: &Captures<'_>| {
            let whole = caps.get(0).map_or("", |m| m.as_str());

            if let (Some(url), Some(host)) = (caps.name("esc"), caps.name("esc_host")) {
                let host = host.as_str().to_ascii_lowercase();
                if scope.should_proxy(&host) {
                    rewritten_domains.insert(host);
                    return format!(
                        "{}\\/{}",
                        scope.gateway_origin.replace('/', "\\/"),
                        url.as_str()
                    );
                }
            } else if let (Some(url), Some(host)) = (caps.name("abs"), caps.name("abs_host")) {
                let host = host.as_str().to_ascii_lowercase();
                if scope.should_proxy(&host) {
                    rewritten_domains.insert(host);
                    return format!("{}/{}", scope.gateway_origin, url.as_str());
                }
            } else if let (Some(prefix), Some(rest), Some(host)) =
                (caps.name("pr_prefix"), caps.name("pr_rest"), caps.name("pr_host"))
            {
                let host = host.as_str().to_ascii_lowercase();
                if scope.should_proxy(&host) {
                    rewritten_domains.insert(host);
                    return format!(
                        "{}//{}/{}",
                        prefix.as_str(),
                        scope.gateway_authority,
                        rest.as_str()
                    );
                }
            }
            whole.to_string()
        })
        .into_owned();

    RewriteResult {
        body,
        rewritten_domains,
    }
}

/// Compare the last two labels of two DNS names. IP literals never share a root.
fn shares_registrable_root(a: &str, b: &str) -> bool {
    match (registrable_root(a), registrable_root(b)) {
        (Some(x), Some(y)) => x.eq_ignore_ascii_case(y),
        _ => false,
    }
}

fn registrable_root(host: &str) -> Option<&str> {
    let host = host.trim_end_matches('.');
    let mut dots = host.rmatch_indices('.');
    dots.next()?;
    let tld = host.rsplit('.').next()?;
    if tld.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match dots.next() {
        Some((idx, _)) => Some(&host[idx + 1..]),
        None => Some(host),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::AccessConfig;
    use crate::routing::target::resolve_target;

    fn policy() -> AccessPolicy {
        AccessPolicy::from_config(&AccessConfig::default())
    }

    fn scope(policy: &AccessPolicy) -> RewriteScope<'_> {
        RewriteScope {
            target_host: "media.example.org",
            gateway_origin: "https://edge.example.net",
            gateway_authority: "edge.example.net",
            gateway_hostname: "edge.example.net",
            policy,
        }
    }

    #[test]
    fn test_auto_proxy_absolute_url_round_trips_through_resolver() {
        let policy = policy();
        let html = r#"<video src="https://acct.blob.core.windows.net/media/ep1.mp4?sig=abc"></video>"#;
        let result = rewrite_body(html, &scope(&policy));

        assert!(result.changed());
        assert!(result.rewritten_domains.contains("acct.blob.core.windows.net"));
        let expected = "https://edge.example.net/https://acct.blob.core.windows.net/media/ep1.mp4?sig=abc";
        assert!(result.body.contains(expected), "{}", result.body);

        // The rewritten path resolves back to the original URL.
        let path = expected.trim_start_matches("https://edge.example.net");
        let (path, query) = path.split_once('?').unwrap();
        let target = resolve_target(path, Some(query)).unwrap();
        assert_eq!(
            target.url(target.explicit_protocol.unwrap()),
            "https://acct.blob.core.windows.net/media/ep1.mp4?sig=abc"
        );
    }

    #[test]
    fn test_same_root_sibling_is_rewritten() {
        let policy = policy();
        let body = r#"{"img":"http://img.example.org:8080/p.png"}"#;
        let result = rewrite_body(body, &scope(&policy));
        assert_eq!(
            result.body,
            r#"{"img":"https://edge.example.net/http://img.example.org:8080/p.png"}"#
        );
    }

    #[test]
    fn test_escaped_urls_keep_escaping() {
        let policy = policy();
        let body = r#"{"u":"https:\/\/cdn.example.org\/a\/b.js"}"#;
        let result = rewrite_body(body, &scope(&policy));
        assert_eq!(
            result.body,
            r#"{"u":"https:\/\/edge.example.net\/https:\/\/cdn.example.org\/a\/b.js"}"#
        );
        assert_eq!(result.rewritten_domains.len(), 1);
    }

    #[test]
    fn test_protocol_relative() {
        let policy = policy();
        let body = r#"<script src="//x1.sharepoint.com/lib.js"></script>"#;
        let result = rewrite_body(body, &scope(&policy));
        assert_eq!(
            result.body,
            r#"<script src="//edge.example.net/x1.sharepoint.com/lib.js"></script>"#
        );
    }

    #[test]
    fn test_each_occurrence_rewritten_once() {
        let policy = policy();
        let body = r#"a https://cdn.example.org/x b "//cdn.example.org/y" c https:\/\/cdn.example.org\/z"#;
        let result = rewrite_body(body, &scope(&policy));
        assert_eq!(result.body.matches("edge.example.net").count(), 3);
        assert!(!result.body.contains("edge.example.net/https://edge.example.net"));
    }

    #[test]
    fn test_skipped_hosts_are_untouched() {
        let policy = policy();
        let body = concat!(
            "https://media.example.org/self ",
            "https://edge.example.net/already ",
            "https://pan.quark.cn/direct ",
            "https://fonts.googleapis.com/blocked ",
            "https://unrelated.net/other",
        );
        let result = rewrite_body(body, &scope(&policy));
        assert_eq!(result.body, body);
        assert!(!result.changed());
    }

    #[test]
    fn test_registrable_root() {
        assert_eq!(registrable_root("a.b.example.org"), Some("example.org"));
        assert_eq!(registrable_root("example.org"), Some("example.org"));
        assert_eq!(registrable_root("localhost"), None);
        assert_eq!(registrable_root("10.0.0.5"), None);
        assert!(!shares_registrable_root("10.0.0.5", "192.168.0.5"));
    }
}
