//! Client-facing gateway errors.
//!
//! Every variant renders as a complete response. Upstream details are
//! sanitized before they get here, so nothing internal leaks to clients.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::security::AccessDenied;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    AccessDenied(#[from] AccessDenied),

    #[error("upstream failure: {detail}")]
    Upstream { detail: String },

    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("forbidden")]
    Forbidden,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn upstream(detail: impl Into<String>) -> Self {
        GatewayError::Upstream {
            detail: detail.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::AccessDenied(_) | GatewayError::Forbidden => StatusCode::FORBIDDEN,
            GatewayError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            GatewayError::AccessDenied(denied) => (
                status,
                Json(json!({ "error": denied.reason.to_string(), "domain": denied.domain })),
            )
                .into_response(),
            GatewayError::Upstream { detail } => (
                status,
                Json(json!({ "error": "Connection failed", "detail": detail })),
            )
                .into_response(),
            GatewayError::PayloadTooLarge { limit } => (
                status,
                Json(json!({ "error": "Payload too large", "limit": limit })),
            )
                .into_response(),
            GatewayError::Forbidden => (
                status,
                [(header::CONTENT_TYPE, "text/plain")],
                "Forbidden",
            )
                .into_response(),
            GatewayError::Internal(message) => {
                tracing::error!(error = %message, "internal gateway error");
                internal_error_response()
            }
        }
    }
}

/// 500 body shared by handler errors and caught panics. The cause is only logged.
pub fn internal_error_response() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Internal error", "message": "internal error" })),
    )
        .into_response()
}
