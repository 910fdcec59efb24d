//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_requests_total` (counter): requests by method, status, upstream protocol
//! - `gateway_request_duration_seconds` (histogram): time until response headers
//! - `gateway_negotiations_total` (counter): protocol resolutions by source
//! - `gateway_protocol_downgrades_total` (counter): https → http fallbacks
//! - `gateway_protocol_cache_entries` (gauge): in-process protocol cache size
//! - `gateway_rewrites_total` (counter): body rewrite outcomes
//! - `gateway_telemetry_events_total` (counter): playback events by type
//! - `gateway_store_errors_total` (counter): key-value store failures by operation
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade and is a no-op until
//!   `init_metrics` installs the Prometheus recorder

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its HTTP scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "metrics exporter listening");
    Ok(())
}

pub fn record_request(method: &str, status: u16, protocol: &str, start: Instant) {
    counter!(
        "gateway_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string(),
        "protocol" => protocol.to_string()
    )
    .increment(1);
    histogram!("gateway_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn record_negotiation(source: &'static str) {
    counter!("gateway_negotiations_total", "source" => source).increment(1);
}

pub fn record_downgrade() {
    counter!("gateway_protocol_downgrades_total").increment(1);
}

pub fn record_protocol_cache_size(entries: usize) {
    gauge!("gateway_protocol_cache_entries").set(entries as f64);
}

pub fn record_rewrite(outcome: &'static str) {
    counter!("gateway_rewrites_total", "outcome" => outcome).increment(1);
}

pub fn record_telemetry_event(event: &'static str) {
    counter!("gateway_telemetry_events_total", "event" => event).increment(1);
}

pub fn record_store_error(op: &'static str) {
    counter!("gateway_store_errors_total", "op" => op).increment(1);
}
