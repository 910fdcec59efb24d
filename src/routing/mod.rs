//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Request path + query
//!     → target.rs (hint, host[:port], remainder → TargetSpec)
//!     → Return: TargetSpec or None (status page)
//!
//! Domain lists (access control, rewriting):
//!     → matcher.rs (label-boundary suffixes, `*` glob patterns)
//! ```
//!
//! # Design Decisions
//! - The upstream is encoded in the path; there is no route table
//! - Deterministic: same path always resolves to the same target
//! - Glob patterns compiled once per config snapshot

pub mod matcher;
pub mod target;

pub use target::{resolve_target, Scheme, TargetSpec};
