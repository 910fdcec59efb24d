//! Domain matching primitives.
//!
//! # Responsibilities
//! - Suffix matching on label boundaries (`mail.google.com` ends with `google.com`,
//!   `notgoogle.com` does not)
//! - Compiled glob patterns for auto-proxy hosts
//!
//! # Design Decisions
//! - Hostnames are compared case-insensitively
//! - Globs compile once per config snapshot, never in the request path
//! - `*` stands for exactly one non-empty label fragment (`[A-Za-z0-9-]+`)

use regex::{Regex, RegexBuilder};

/// Returns true if `hostname` equals `domain` or is a subdomain of it.
pub fn matches_suffix(hostname: &str, domain: &str) -> bool {
    let hostname = hostname.trim_end_matches('.');
    let domain = domain.trim_end_matches('.');
    if domain.is_empty() {
        return false;
    }
    if hostname.eq_ignore_ascii_case(domain) {
        return true;
    }
    hostname.len() > domain.len()
        && hostname.as_bytes()[hostname.len() - domain.len() - 1] == b'.'
        && hostname[hostname.len() - domain.len()..].eq_ignore_ascii_case(domain)
}

/// Returns true if `hostname` matches any domain in `list` on a label boundary.
pub fn matches_any_suffix<S: AsRef<str>>(hostname: &str, list: &[S]) -> bool {
    list.iter().any(|d| matches_suffix(hostname, d.as_ref()))
}

/// A compiled host glob such as `*.blob.core.windows.net`.
#[derive(Debug, Clone)]
pub struct DomainPattern {
    source: String,
    regex: Regex,
}

impl DomainPattern {
    /// Compile a glob. Dots are literal; `*` matches one or more of `[A-Za-z0-9-]`.
    pub fn compile(pattern: &str) -> Result<Self, regex::Error> {
        let mut expr = String::with_capacity(pattern.len() + 16);
        expr.push('^');
        for ch in pattern.chars() {
            match ch {
                '*' => expr.push_str("[A-Za-z0-9-]+"),
                other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
            }
        }
        expr.push('$');

        let regex = RegexBuilder::new(&expr).case_insensitive(true).build()?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, hostname: &str) -> bool {
        self.regex.is_match(hostname)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}
