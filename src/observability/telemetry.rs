//! Playback usage telemetry.
//!
//! Requests whose upstream path looks like a playback call produce one
//! `TelemetryEvent`. Sinks are fire-and-forget: `record` must not block the
//! request and has no way to fail it.

use std::sync::Arc;

use serde::Serialize;

use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Playing,
    PlaybackInfo,
    Stream,
}

impl EventType {
    /// Classify an upstream path. `/Playing` wins over `/PlaybackInfo`, which wins over `/stream`.
    pub fn classify(path: &str) -> Option<Self> {
        if path.contains("/Playing") {
            Some(EventType::Playing)
        } else if path.contains("/PlaybackInfo") {
            Some(EventType::PlaybackInfo)
        } else if path.contains("/stream") {
            Some(EventType::Stream)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Playing => "playing",
            EventType::PlaybackInfo => "playback_info",
            EventType::Stream => "stream",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryEvent {
    pub event_type: EventType,
    pub upstream_host: String,
    pub client_country: String,
    pub edge_id: String,
    pub count: u64,
}

pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: TelemetryEvent);
}

/// Discards every event.
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn record(&self, _event: TelemetryEvent) {}
}

/// Emits events as structured log lines under the `telemetry` target.
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn record(&self, event: TelemetryEvent) {
        tracing::info!(
            target: "telemetry",
            event_type = event.event_type.as_str(),
            upstream_host = %event.upstream_host,
            client_country = %event.client_country,
            edge_id = %event.edge_id,
            count = event.count,
            "playback event"
        );
    }
}

/// Build and dispatch an event for `path` if it is a playback call.
pub fn record_playback(
    sink: &Arc<dyn TelemetrySink>,
    path: &str,
    upstream_host: &str,
    client_country: &str,
    edge_id: &str,
) -> Option<EventType> {
    let event_type = EventType::classify(path)?;
    metrics::record_telemetry_event(event_type.as_str());
    sink.record(TelemetryEvent {
        event_type,
        upstream_host: upstream_host.to_string(),
        client_country: client_country.to_string(),
        edge_id: edge_id.to_string(),
        count: 1,
    });
    Some(event_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Capture(Mutex<Vec<TelemetryEvent>>);

    impl TelemetrySink for Capture {
        fn record(&self, event: TelemetryEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn classifies_playback_paths() {
        assert_eq!(
            EventType::classify("/emby/Sessions/Playing/Progress"),
            Some(EventType::Playing)
        );
        assert_eq!(
            EventType::classify("/Items/42/PlaybackInfo"),
            Some(EventType::PlaybackInfo)
        );
        assert_eq!(
            EventType::classify("/Videos/42/stream.mkv"),
            Some(EventType::Stream)
        );
        assert_eq!(EventType::classify("/web/index.html"), None);
    }

    #[test]
    fn records_one_event_per_call() {
        let capture = Arc::new(Capture::default());
        let sink: Arc<dyn TelemetrySink> = capture.clone();

        let recorded = record_playback(&sink, "/Sessions/Playing", "media.example.org", "HK", "8a1b-HKG");
        assert_eq!(recorded, Some(EventType::Playing));
        assert_eq!(record_playback(&sink, "/web/", "media.example.org", "HK", "x"), None);

        let events = capture.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].upstream_host, "media.example.org");
        assert_eq!(events[0].count, 1);
        assert_eq!(
            serde_json::to_value(&events[0]).unwrap()["event_type"],
            "playing"
        );
    }
}
