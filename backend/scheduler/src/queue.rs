//! Front of the durable queue: enqueue, claim, wake-ups, cancel, counts.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info};

use jobforge_core::{
    CancelOutcome, EngineError, Job, QueueEntry, QueuePayload, QueueStore, TriggerKind,
};

/// Queue depth plus pool size, as reported to dashboards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueMetrics {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub workers: usize,
}

pub struct JobQueue {
    store: Arc<dyn QueueStore>,
    wake: Notify,
}

impl JobQueue {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            wake: Notify::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    /// Persist a new entry for `job` and wake one idle worker. Returns the dispatch id.
    pub async fn enqueue(
        &self,
        job: &Job,
        trigger: TriggerKind,
        priority: i32,
        max_attempts: u32,
    ) -> Result<String, EngineError> {
        let entry = QueueEntry::new(QueuePayload::from(job), trigger, priority, max_attempts);
        self.store.push(&entry).await?;
        info!(
            dispatch_id = %entry.id,
            job_id = %job.id,
            trigger = %trigger,
            priority,
            max_attempts = entry.max_attempts,
            "Job enqueued"
        );
        self.wake.notify_one();
        Ok(entry.id)
    }

    pub async fn claim(&self, now: DateTime<Utc>) -> Result<Option<QueueEntry>, EngineError> {
        Ok(self.store.claim_next(now).await?)
    }

    /// Park until something is enqueued or `poll` elapses.
    pub async fn wait(&self, poll: Duration) {
        let _ = tokio::time::timeout(poll, self.wake.notified()).await;
    }

    /// Wake every parked worker (used on shutdown and after bulk dispatch).
    pub fn wake_all(&self) {
        self.wake.notify_waiters();
    }

    pub async fn cancel(&self, dispatch_id: &str) -> Result<CancelOutcome, EngineError> {
        let outcome = self
            .store
            .cancel(dispatch_id)
            .await?
            .ok_or_else(|| EngineError::DispatchNotFound(dispatch_id.to_string()))?;
        debug!(dispatch_id = %dispatch_id, outcome = ?outcome, "Cancel requested");
        Ok(outcome)
    }

    pub async fn metrics(&self, workers: usize) -> Result<QueueMetrics, EngineError> {
        let counts = self.store.counts(Utc::now()).await?;
        Ok(QueueMetrics {
            waiting: counts.waiting,
            active: counts.active,
            completed: counts.completed,
            failed: counts.failed,
            delayed: counts.delayed,
            workers,
        })
    }
}
