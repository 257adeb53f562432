//! Events, metrics and log initialization.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use propagator_api::Resource;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Reason attached to every event the propagator records.
pub const EVENT_REASON: &str = "PolicyPropagation";

/// Histogram of root policy reconciliation wall-clock time.
pub const ROOT_POLICY_DURATION_METRIC: &str = "ocm_handle_root_policy_duration_seconds";

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventType {
    Normal,
    Warning,
}

/// Object an event is recorded against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventSubject {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl EventSubject {
    /// Subject naming the given object.
    pub fn of<K: Resource>(object: &K) -> Self {
        Self {
            kind: K::KIND.to_string(),
            namespace: object.namespace().to_string(),
            name: object.name().to_string(),
        }
    }
}

/// Sink for user-visible events.
pub trait EventRecorder: Send + Sync {
    fn record(&self, subject: &EventSubject, event_type: EventType, reason: &str, message: &str);
}

/// Emits events as log lines.
#[derive(Debug, Default)]
pub struct TracingEventRecorder;

impl EventRecorder for TracingEventRecorder {
    fn record(&self, subject: &EventSubject, event_type: EventType, reason: &str, message: &str) {
        match event_type {
            EventType::Normal => info!(
                kind = %subject.kind,
                namespace = %subject.namespace,
                name = %subject.name,
                reason,
                "{message}"
            ),
            EventType::Warning => warn!(
                kind = %subject.kind,
                namespace = %subject.namespace,
                name = %subject.name,
                reason,
                "{message}"
            ),
        }
    }
}

/// An event captured by [`MemoryEventRecorder`].
#[derive(Debug, Clone, Serialize)]
pub struct RecordedEvent {
    pub subject: EventSubject,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

/// Keeps every recorded event in memory.
#[derive(Debug, Default)]
pub struct MemoryEventRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far, oldest first.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Messages of events of the given type.
    pub fn messages(&self, event_type: EventType) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .map(|e| e.message)
            .collect()
    }
}

impl EventRecorder for MemoryEventRecorder {
    fn record(&self, subject: &EventSubject, event_type: EventType, reason: &str, message: &str) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(RecordedEvent {
                subject: subject.clone(),
                event_type,
                reason: reason.to_string(),
                message: message.to_string(),
                recorded_at: Utc::now(),
            });
    }
}

/// Record a duration sample through the metrics facade.
pub fn observe_duration(metric: &'static str, seconds: f64) {
    metrics::histogram!(metric).record(seconds);
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `log_level`. Logs go to stderr.
pub fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
        }))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject() -> EventSubject {
        EventSubject {
            kind: "Policy".into(),
            namespace: "default".into(),
            name: "p1".into(),
        }
    }

    #[test]
    fn test_memory_recorder_keeps_order() {
        let recorder = MemoryEventRecorder::new();
        recorder.record(&subject(), EventType::Normal, EVENT_REASON, "first");
        recorder.record(&subject(), EventType::Warning, EVENT_REASON, "second");
        recorder.record(&subject(), EventType::Normal, EVENT_REASON, "third");

        let events = recorder.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].message, "first");
        assert_eq!(events[1].reason, EVENT_REASON);
        assert_eq!(recorder.messages(EventType::Normal), vec!["first", "third"]);
    }

    #[test]
    fn test_observe_duration_without_recorder() {
        // No global recorder installed: the facade drops the sample.
        observe_duration(ROOT_POLICY_DURATION_METRIC, 0.25);
    }
}
