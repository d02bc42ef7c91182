//! Lifecycle events for external observability
//!
//! Every run state transition, gateway cache decision and safety cooldown
//! change is published as a [`LifecycleEvent`] through an [`EventSink`].
//! Sinks must not block: they are called from inside the acquisition path.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{CooldownReason, RunId, RunStatus};

/// Observable events emitted by the harvesting subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// A run changed status
    RunTransition {
        run_id: RunId,
        scope: String,
        from: Option<RunStatus>,
        to: RunStatus,
        at: DateTime<Utc>,
    },

    /// One scholar finished its share of a run
    ScholarProcessed {
        run_id: RunId,
        scholar_id: String,
        outcome: String,
        pages_fetched: u32,
        new_publications: u64,
    },

    /// Response served from the gateway cache
    GatewayCacheHit { service: String, fingerprint: String },

    /// No cached response; the request proceeds
    GatewayCacheMiss { service: String, fingerprint: String },

    /// Caller attached to an identical in-flight request
    GatewayCoalesced { service: String, fingerprint: String },

    /// Service-wide pause after a rate-limit response
    GatewayCooldown { service: String, until: DateTime<Utc> },

    /// Scope entered a safety cooldown
    CooldownEntered {
        scope: String,
        reason: CooldownReason,
        until: DateTime<Utc>,
    },

    /// Scope's safety cooldown expired
    CooldownCleared { scope: String },

    /// Scholar placed (or updated) in the continuation queue
    QueueItemEnqueued {
        scholar_id: String,
        resume_cstart: u32,
        attempt_count: u32,
        next_attempt_at: DateTime<Utc>,
    },

    /// Queue item stopped retrying automatically
    QueueItemDropped { scholar_id: String, reason: String },

    /// Identifier resolution finished for a run
    EnrichmentCompleted {
        run_id: RunId,
        resolved: u32,
        skipped: u32,
        failed: u32,
    },
}

impl LifecycleEvent {
    /// Short event name for logs
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::RunTransition { .. } => "run_transition",
            LifecycleEvent::ScholarProcessed { .. } => "scholar_processed",
            LifecycleEvent::GatewayCacheHit { .. } => "gateway_cache_hit",
            LifecycleEvent::GatewayCacheMiss { .. } => "gateway_cache_miss",
            LifecycleEvent::GatewayCoalesced { .. } => "gateway_coalesced",
            LifecycleEvent::GatewayCooldown { .. } => "gateway_cooldown",
            LifecycleEvent::CooldownEntered { .. } => "cooldown_entered",
            LifecycleEvent::CooldownCleared { .. } => "cooldown_cleared",
            LifecycleEvent::QueueItemEnqueued { .. } => "queue_item_enqueued",
            LifecycleEvent::QueueItemDropped { .. } => "queue_item_dropped",
            LifecycleEvent::EnrichmentCompleted { .. } => "enrichment_completed",
        }
    }
}

/// Destination for lifecycle events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: LifecycleEvent);
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: LifecycleEvent) {}
}

/// Sink that keeps every event in memory (tests, CLI summaries)
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    /// Count events with the given name
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: LifecycleEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = LifecycleEvent::CooldownCleared {
            scope: "lab".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "cooldown_cleared");
        assert_eq!(json["scope"], "lab");
    }

    #[test]
    fn test_recording_sink_counts() {
        let sink = RecordingSink::new();
        sink.emit(LifecycleEvent::GatewayCacheHit {
            service: "crossref".into(),
            fingerprint: "abc".into(),
        });
        sink.emit(LifecycleEvent::GatewayCacheMiss {
            service: "crossref".into(),
            fingerprint: "def".into(),
        });
        assert_eq!(sink.count("gateway_cache_hit"), 1);
        assert_eq!(sink.events().len(), 2);
    }
}
