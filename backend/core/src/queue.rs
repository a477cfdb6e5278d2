use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConfigMap, Job, TriggerKind};

/// What a worker needs to run a job, carried on every queue entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueuePayload {
    pub job_id: String,
    pub module_id: String,
    pub handler: String,
    #[serde(default)]
    pub config: ConfigMap,
}

impl From<&Job> for QueuePayload {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            module_id: job.module_id.clone(),
            handler: job.handler.clone(),
            config: job.config.clone(),
        }
    }
}

/// Where a queue entry is in its life.
///
/// `Waiting` entries whose `run_at` lies in the future are reported as delayed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Waiting,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Waiting => "waiting",
            QueueState::Active => "active",
            QueueState::Completed => "completed",
            QueueState::Failed => "failed",
            QueueState::Cancelled => "cancelled",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            QueueState::Completed | QueueState::Failed | QueueState::Cancelled
        )
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(QueueState::Waiting),
            "active" => Ok(QueueState::Active),
            "completed" => Ok(QueueState::Completed),
            "failed" => Ok(QueueState::Failed),
            "cancelled" => Ok(QueueState::Cancelled),
            other => Err(format!("unknown queue state '{other}'")),
        }
    }
}

/// One unit of dispatchable work in the durable queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    /// Dispatch id handed back to callers.
    pub id: String,
    pub payload: QueuePayload,
    pub trigger: TriggerKind,
    /// Higher runs first; FIFO among equal priority.
    pub priority: i32,
    pub state: QueueState,
    /// Earliest instant the entry may be claimed.
    pub run_at: DateTime<Utc>,
    /// Attempts already started (0 before the first claim).
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(payload: QueuePayload, trigger: TriggerKind, priority: i32, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            trigger,
            priority,
            state: QueueState::Waiting,
            run_at: now,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            last_error: None,
            created_at: now,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.payload.job_id
    }
}

/// Registration that re-dispatches a job on a cron cadence. Keyed by job id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecurringEntry {
    pub job_id: String,
    pub cron: String,
    pub timezone: String,
    pub next_run_at: DateTime<Utc>,
}

/// Queue depth snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

/// Result of a best-effort cancel request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The entry had not started and will never run.
    Removed,
    /// A worker already owns the entry; it runs until it ends or times out.
    AlreadyRunning,
    AlreadyFinished,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_from_job_copies_handler_reference() {
        let mut job = Job::new("j1", "Report", "m1", "handlers/report.py");
        job.config.insert("region".into(), serde_json::json!("eu"));
        let payload = QueuePayload::from(&job);
        assert_eq!(payload.job_id, "j1");
        assert_eq!(payload.handler, "handlers/report.py");
        assert_eq!(payload.config["region"], "eu");
    }

    #[test]
    fn new_entry_needs_at_least_one_attempt() {
        let job = Job::new("j1", "Report", "m1", "run.sh");
        let entry = QueueEntry::new(QueuePayload::from(&job), TriggerKind::Manual, 0, 0);
        assert_eq!(entry.max_attempts, 1);
        assert_eq!(entry.state, QueueState::Waiting);
        assert_eq!(entry.job_id(), "j1");
    }
}
