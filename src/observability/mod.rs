//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events, pretty or JSON)
//!     → metrics.rs (counters, gauges, histograms)
//!     → telemetry.rs (playback events for a TelemetrySink)
//!
//! Consumers:
//!     → stdout / log aggregation
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Request ID flows through all log lines via the request span
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
pub mod telemetry;
