use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::engine::JobStats;
use crate::store::JobType;

/// Push update emitted by a running job. Tagged so dashboard clients can
/// route on `type` without knowing every payload shape.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum JobEvent {
    Produce(ProducePoint),
    Consume(ConsumePoint),
    LoadtestStats(JobSnapshot),
    LoadtestComplete(JobSnapshot),
    ProduceComplete(JobSnapshot),
    ConsumeComplete(JobSnapshot),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub current: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducePoint {
    pub job_id: String,
    pub progress: Progress,
    pub stats: JobStats,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumePoint {
    pub job_id: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub stats: JobStats,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job_id: String,
    pub job_type: JobType,
    pub stats: JobStats,
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Produce(p) => &p.job_id,
            Self::Consume(p) => &p.job_id,
            Self::LoadtestStats(s)
            | Self::LoadtestComplete(s)
            | Self::ProduceComplete(s)
            | Self::ConsumeComplete(s) => &s.job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::LoadtestComplete(_) | Self::ProduceComplete(_) | Self::ConsumeComplete(_)
        )
    }
}

/// Fire-and-forget event outlet. Publishing never blocks a work loop and a
/// missing audience is not an error.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &JobEvent);
}

/// Broadcast-channel sink: events are serialized once and fanned out to every
/// connected subscriber (websocket sessions, in practice).
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<String>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for EventBroadcaster {
    fn publish(&self, event: &JobEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize job event");
                return;
            }
        };
        // Err means no live subscribers; drop the event.
        let _ = self.tx.send(payload);
    }
}

/// Test sink that records every event it sees.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<JobEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<JobEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl EventSink for MemorySink {
    fn publish(&self, event: &JobEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}
