//! User-agent based bot filter.

use axum::http::{header, HeaderMap};

use crate::config::schema::SecurityConfig;

/// Returns true if the request must be refused with 403.
pub fn is_blocked_agent(headers: &HeaderMap, config: &SecurityConfig) -> bool {
    if !config.bot_protection {
        return false;
    }

    let agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .trim();

    if agent.is_empty() {
        return config.block_empty_user_agent;
    }

    let agent = agent.to_ascii_lowercase();
    config
        .blocked_user_agents
        .iter()
        .any(|token| !token.is_empty() && agent.contains(&token.to_ascii_lowercase()))
}
