//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (capacities and timeouts > 0, statuses in range)
//! - Make sure every auto-proxy glob compiles before it reaches a snapshot
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::GatewayConfig;
use crate::routing::matcher::DomainPattern;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }

    if let Some(tls) = &config.listener.tls {
        if tls.cert_path.is_empty() || tls.key_path.is_empty() {
            errors.push(ValidationError::new(
                "listener.tls",
                "cert_path and key_path must both be set",
            ));
        }
    }

    if let Some(origin) = &config.listener.public_origin {
        match url::Url::parse(origin) {
            Ok(parsed) if parsed.has_host() => {}
            _ => errors.push(ValidationError::new(
                "listener.public_origin",
                format!("'{}' is not an absolute origin", origin),
            )),
        }
    }

    for (field, value) in [
        ("timeouts.connect_secs", config.timeouts.connect_secs),
        ("timeouts.forward_secs", config.timeouts.forward_secs),
        ("timeouts.request_secs", config.timeouts.request_secs),
        (
            "negotiation.protocol_cache_ttl_secs",
            config.negotiation.protocol_cache_ttl_secs,
        ),
        ("negotiation.probe_timeout_ms", config.negotiation.probe_timeout_ms),
        ("store.write_timeout_ms", config.store.write_timeout_ms),
        ("remote.refresh_secs", config.remote.refresh_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }

    if config.negotiation.cache_capacity == 0 {
        errors.push(ValidationError::new(
            "negotiation.cache_capacity",
            "must be greater than 0",
        ));
    }
    if config.rewrite.max_body_bytes == 0 {
        errors.push(ValidationError::new(
            "rewrite.max_body_bytes",
            "must be greater than 0",
        ));
    }
    if config.security.max_request_body_bytes == 0 {
        errors.push(ValidationError::new(
            "security.max_request_body_bytes",
            "must be greater than 0",
        ));
    }

    for status in &config.negotiation.tls_interception_statuses {
        if !(100..=599).contains(status) {
            errors.push(ValidationError::new(
                "negotiation.tls_interception_statuses",
                format!("{} is not an HTTP status", status),
            ));
        }
    }

    for pattern in &config.access.auto_proxy_patterns {
        if let Err(e) = DomainPattern::compile(pattern) {
            errors.push(ValidationError::new(
                "access.auto_proxy_patterns",
                format!("'{}' does not compile: {}", pattern, e),
            ));
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!(
                "'{}' is not a socket address",
                config.observability.metrics_address
            ),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::TlsConfig;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(validate_config(&GatewayConfig::default()), Ok(()));
    }

    #[test]
    fn collects_every_error() {
        let mut config = GatewayConfig::default();
        config.listener.bind_address = "not-an-address".into();
        config.negotiation.cache_capacity = 0;
        config.negotiation.protocol_cache_ttl_secs = 0;
        config.negotiation.tls_interception_statuses = vec![525, 1000];
        config.listener.tls = Some(TlsConfig {
            cert_path: "cert.pem".into(),
            key_path: String::new(),
        });

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(errors.len(), 5);
        assert!(fields.contains(&"listener.bind_address"));
        assert!(fields.contains(&"listener.tls"));
        assert!(fields.contains(&"negotiation.cache_capacity"));
        assert!(fields.contains(&"negotiation.protocol_cache_ttl_secs"));
        assert!(fields.contains(&"negotiation.tls_interception_statuses"));
    }

    #[test]
    fn rejects_relative_public_origin() {
        let mut config = GatewayConfig::default();
        config.listener.public_origin = Some("edge.example.net".into());
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "listener.public_origin");
    }
}
