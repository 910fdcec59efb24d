//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, pipeline dispatch)
//!     → request.rs (per-request context, client metadata, gateway origin)
//!     → forward.rs (upstream request, https → http retry)
//!       | websocket.rs (upgrade tunnel)
//!     → response.rs (redirects, header policy, CORS)
//!     → rewrite.rs (in-body URL rewriting)
//!     → Send to client
//! ```

pub mod forward;
pub mod request;
pub mod response;
pub mod rewrite;
pub mod server;
pub mod status;
pub mod websocket;

pub use request::{ProxyContext, X_REQUEST_ID};
pub use server::{AppState, HttpServer};
pub use status::{DefaultStatusPage, StatusPage};
