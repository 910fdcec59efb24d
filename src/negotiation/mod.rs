//! Protocol negotiation subsystem.
//!
//! # Data Flow
//! ```text
//! TargetSpec
//!     → negotiator.rs (hint / port / cache / store / probe)
//!     → cache.rs (bounded LRU, TTL)
//!     → store (persistent tier, shared across restarts)
//!     → Resolution { scheme, source }
//!
//! Forward failure over https:
//!     → ProtocolNegotiator::downgrade → both tiers pinned to http
//! ```

pub mod cache;
pub mod negotiator;

pub use cache::ProtocolCache;
pub use negotiator::{HttpsProbe, ProtocolNegotiator, ProtocolProbe, Resolution, ResolutionSource};
