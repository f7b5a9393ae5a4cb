//! Per-pipeline publish/subscribe channels.

use crate::db::now_ms;
use crate::types::{Phase, Pipeline};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PhaseStarted,
    PhaseCompleted,
    StagingReady,
    Completed,
    Failed,
    RolledBack,
    /// Periodic status push, never published on the bus.
    Status,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PhaseStarted => "phase_started",
            EventKind::PhaseCompleted => "phase_completed",
            EventKind::StagingReady => "staging_ready",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::RolledBack => "rolled_back",
            EventKind::Status => "status",
        }
    }
}

/// A named pipeline event carrying a state snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineEvent {
    pub kind: EventKind,
    pub pipeline_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    pub snapshot: Pipeline,
    pub timestamp: i64,
}

impl PipelineEvent {
    pub fn new(kind: EventKind, snapshot: &Pipeline, phase: Option<Phase>) -> Self {
        Self {
            kind,
            pipeline_id: snapshot.id,
            phase,
            snapshot: snapshot.clone(),
            timestamp: now_ms(),
        }
    }
}

/// Lazily created broadcast channel per pipeline.
///
/// Receivers unsubscribe by being dropped; channels without receivers are
/// pruned on the next publish.
#[derive(Default)]
pub struct EventBus {
    channels: Mutex<HashMap<i64, broadcast::Sender<PipelineEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, pipeline_id: i64) -> broadcast::Receiver<PipelineEvent> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(pipeline_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Deliver an event to current subscribers. Returns how many received it.
    pub fn publish(&self, event: PipelineEvent) -> usize {
        let mut channels = self.channels.lock().unwrap();
        let pipeline_id = event.pipeline_id;
        let kind = event.kind;
        let delivered = match channels.get(&pipeline_id) {
            Some(tx) => tx.send(event).unwrap_or(0),
            None => 0,
        };
        if delivered == 0 {
            channels.remove(&pipeline_id);
        }
        debug!(pipeline_id, event = kind.as_str(), delivered, "Published pipeline event");
        delivered
    }

    pub fn subscriber_count(&self, pipeline_id: i64) -> usize {
        self.channels
            .lock()
            .unwrap()
            .get(&pipeline_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{initial_phases, Budget, PipelineMode, PipelineStatus};
    use serde_json::json;

    fn pipeline(id: i64) -> Pipeline {
        Pipeline {
            id,
            prompt: "p".into(),
            mode: PipelineMode::Act,
            status: PipelineStatus::Running,
            current_phase: Some(Phase::Design),
            phases: initial_phases(),
            budget: Budget::new(1000, 5),
            correlation_id: "c".into(),
            metadata: json!({}),
            requested_by: "test".into(),
            error: None,
            created_at: 0,
            updated_at: 0,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_events_are_scoped_per_pipeline() {
        let bus = EventBus::new();
        let mut one = bus.subscribe(1);
        let mut two = bus.subscribe(2);

        assert_eq!(bus.publish(PipelineEvent::new(EventKind::PhaseStarted, &pipeline(1), Some(Phase::Design))), 1);
        let event = one.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::PhaseStarted);
        assert_eq!(event.pipeline_id, 1);
        assert!(two.try_recv().is_err());
    }

    #[test]
    fn test_dropped_receivers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe(7);
        assert_eq!(bus.subscriber_count(7), 1);
        drop(rx);
        assert_eq!(bus.publish(PipelineEvent::new(EventKind::Completed, &pipeline(7), None)), 0);
        assert_eq!(bus.subscriber_count(7), 0);
        assert!(bus.channels.lock().unwrap().is_empty());
    }
}
