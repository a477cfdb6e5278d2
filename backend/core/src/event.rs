use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// A lifecycle notification about one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: Uuid,
    pub kind: JobEventKind,
    pub job_id: String,
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobEventKind {
    #[serde(rename = "job.started")]
    Started,
    #[serde(rename = "job.completed")]
    Completed,
    #[serde(rename = "job.failed")]
    Failed,
}

impl JobEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventKind::Started => "job.started",
            JobEventKind::Completed => "job.completed",
            JobEventKind::Failed => "job.failed",
        }
    }
}

impl std::fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl JobEvent {
    pub fn new(
        kind: JobEventKind,
        job_id: impl Into<String>,
        execution_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            job_id: job_id.into(),
            execution_id: execution_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Sink for lifecycle events. Publishing is best-effort and never fails the caller.
pub trait EventBus: Send + Sync {
    fn publish(&self, event: JobEvent);
}

/// In-process fan-out over a tokio broadcast channel.
pub struct BroadcastEventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: JobEvent) {
        debug!(kind = %event.kind, job_id = %event.job_id, "Publishing job event");
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_uses_dotted_names() {
        assert_eq!(JobEventKind::Started.to_string(), "job.started");
        let json = serde_json::to_string(&JobEventKind::Failed).unwrap();
        assert_eq!(json, "\"job.failed\"");
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = BroadcastEventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(JobEvent::new(
            JobEventKind::Completed,
            "job-1",
            "exec-1",
            serde_json::json!({"durationMs": 12}),
        ));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, JobEventKind::Completed);
        assert_eq!(event.execution_id, "exec-1");
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = BroadcastEventBus::new(1);
        bus.publish(JobEvent::new(JobEventKind::Started, "j", "e", serde_json::Value::Null));
    }
}
