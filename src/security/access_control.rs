//! Upstream domain policy.
//!
//! # Responsibilities
//! - Decide whether a hostname may be proxied (blocklist, optional whitelist)
//! - Classify hostnames clients must reach directly
//! - Classify backend hosts that join a proxied session automatically
//!
//! # Design Decisions
//! - The blocklist wins unconditionally, whitelist mode only narrows further
//! - A policy is immutable; reloads build a new one and swap the snapshot
//! - Auto-proxy globs are compiled here once, invalid ones are logged and skipped

use std::fmt;

use thiserror::Error;

use crate::config::schema::AccessConfig;
use crate::routing::matcher::{matches_any_suffix, DomainPattern};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Blocked,
    NotWhitelisted,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::Blocked => f.write_str("Domain blocked"),
            DenyReason::NotWhitelisted => f.write_str("Domain not in whitelist"),
        }
    }
}

/// Why a hostname was refused, and which one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}: {domain}")]
pub struct AccessDenied {
    pub reason: DenyReason,
    pub domain: String,
}

#[derive(Debug, Clone)]
pub struct AccessPolicy {
    whitelist_enabled: bool,
    blocked: Vec<String>,
    allowed: Vec<String>,
    direct_redirect: Vec<String>,
    auto_proxy: Vec<DomainPattern>,
}

impl AccessPolicy {
    pub fn from_config(config: &AccessConfig) -> Self {
        let auto_proxy = config
            .auto_proxy_patterns
            .iter()
            .filter_map(|pattern| match DomainPattern::compile(pattern) {
                Ok(compiled) => Some(compiled),
                Err(e) => {
                    tracing::warn!(pattern = %pattern, error = %e, "skipping invalid auto-proxy pattern");
                    None
                }
            })
            .collect();

        Self {
            whitelist_enabled: config.whitelist_enabled,
            blocked: normalize(&config.blocked_upstreams),
            // `.example.com` and `example.com` both cover the domain and its subdomains.
            allowed: normalize(&config.allowed_upstreams)
                .into_iter()
                .map(|d| d.trim_start_matches('.').to_string())
                .filter(|d| !d.is_empty())
                .collect(),
            direct_redirect: normalize(&config.direct_redirect_domains),
            auto_proxy,
        }
    }

    pub fn check_access(&self, hostname: &str) -> Result<(), AccessDenied> {
        if matches_any_suffix(hostname, &self.blocked) {
            return Err(AccessDenied {
                reason: DenyReason::Blocked,
                domain: hostname.to_string(),
            });
        }
        if self.whitelist_enabled && !matches_any_suffix(hostname, &self.allowed) {
            return Err(AccessDenied {
                reason: DenyReason::NotWhitelisted,
                domain: hostname.to_string(),
            });
        }
        Ok(())
    }

    pub fn is_denied(&self, hostname: &str) -> bool {
        self.check_access(hostname).is_err()
    }

    pub fn is_direct_domain(&self, hostname: &str) -> bool {
        matches_any_suffix(hostname, &self.direct_redirect)
    }

    pub fn is_auto_proxy_domain(&self, hostname: &str) -> bool {
        self.auto_proxy.iter().any(|p| p.matches(hostname))
    }

    pub fn whitelist_enabled(&self) -> bool {
        self.whitelist_enabled
    }

    /// Sizes of the blocked, allowed, direct and auto-proxy lists.
    pub fn summary(&self) -> PolicySummary {
        PolicySummary {
            whitelist_enabled: self.whitelist_enabled,
            blocked: self.blocked.len(),
            allowed: self.allowed.len(),
            direct_redirect: self.direct_redirect.len(),
            auto_proxy: self.auto_proxy.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicySummary {
    pub whitelist_enabled: bool,
    pub blocked: usize,
    pub allowed: usize,
    pub direct_redirect: usize,
    pub auto_proxy: usize,
}

fn normalize(list: &[String]) -> Vec<String> {
    list.iter()
        .map(|d| d.trim().to_ascii_lowercase())
        .filter(|d| !d.is_empty())
        .collect()
}
