//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → bot.rs (user-agent filter, 403 on match)
//!     → access_control.rs (blocklist / whitelist on the resolved host)
//!     → headers.rs (drop untrusted forwarding fields, add X-Forwarded-*)
//!     → forward upstream
//! ```
//!
//! # Design Decisions
//! - Fail closed: a denied host never reaches the network
//! - No trust in client input: edge and forwarding headers are rebuilt

pub mod access_control;
pub mod bot;
pub mod headers;

pub use access_control::{AccessDenied, AccessPolicy, DenyReason};
