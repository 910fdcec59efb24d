//! Protocol-adaptive edge gateway library.
//!
//! Clients address an upstream by putting it in the path
//! (`/{host}[:port]/{path}`); the gateway picks http or https for it, forwards
//! the request and rewrites the response so the session stays on the gateway.

pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod negotiation;
pub mod net;
pub mod observability;
pub mod routing;
pub mod security;
pub mod store;

pub use config::schema::GatewayConfig;
pub use error::GatewayError;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
