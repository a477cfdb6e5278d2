use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::queue::{CancelOutcome, QueueCounts, QueueEntry, RecurringEntry};
use crate::types::{ExecutionFinish, Job, JobExecution, JobSchedule, Module};

/// Lookup of installed modules and their root directories.
#[async_trait]
pub trait ModuleRegistry: Send + Sync {
    async fn get_module(&self, id: &str) -> Result<Option<Module>, StoreError>;

    async fn upsert_module(&self, module: &Module) -> Result<(), StoreError>;
}

/// System of record for job definitions and their cron bindings.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError>;

    async fn list_job_ids(&self) -> Result<Vec<String>, StoreError>;

    async fn upsert_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Returns `false` when no row matched.
    async fn delete_job(&self, id: &str) -> Result<bool, StoreError>;

    async fn get_schedule(&self, job_id: &str) -> Result<Option<JobSchedule>, StoreError>;

    /// Create or replace the single schedule row for `schedule.job_id`.
    async fn upsert_schedule(&self, schedule: &JobSchedule) -> Result<(), StoreError>;

    async fn set_schedule_enabled(&self, job_id: &str, enabled: bool) -> Result<bool, StoreError>;

    async fn record_schedule_run(
        &self,
        job_id: &str,
        last_run: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Persistent record of each run.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_execution(&self, execution: &JobExecution) -> Result<(), StoreError>;

    /// Writes the terminal state only if the record is still pending or running.
    /// Returns `false` when the record was already finalised (or does not exist).
    async fn finish_execution(&self, id: &str, finish: &ExecutionFinish) -> Result<bool, StoreError>;

    async fn append_logs(&self, id: &str, logs: &str) -> Result<(), StoreError>;

    async fn get_execution(&self, id: &str) -> Result<Option<JobExecution>, StoreError>;

    /// Most recent first.
    async fn list_executions(&self, job_id: &str, limit: usize) -> Result<Vec<JobExecution>, StoreError>;

    /// Marks every still-running record as failed with `error`. Used at startup.
    async fn fail_interrupted(&self, error: &str) -> Result<usize, StoreError>;
}

/// Durable backing for the work queue and its recurring registrations.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn push(&self, entry: &QueueEntry) -> Result<(), StoreError>;

    /// Atomically claims the highest-priority, oldest entry eligible at `now`,
    /// moving it to active and counting the attempt.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<QueueEntry>, StoreError>;

    async fn get_entry(&self, id: &str) -> Result<Option<QueueEntry>, StoreError>;

    async fn complete(&self, id: &str) -> Result<(), StoreError>;

    async fn fail(&self, id: &str, error: &str) -> Result<(), StoreError>;

    /// Puts an active entry back to waiting, eligible again at `run_at`.
    async fn reschedule(&self, id: &str, run_at: DateTime<Utc>, error: Option<&str>) -> Result<(), StoreError>;

    /// Puts an active entry back to waiting without charging the attempt.
    async fn defer(&self, id: &str, run_at: DateTime<Utc>) -> Result<(), StoreError>;

    /// `None` when the id is unknown.
    async fn cancel(&self, id: &str) -> Result<Option<CancelOutcome>, StoreError>;

    async fn counts(&self, now: DateTime<Utc>) -> Result<QueueCounts, StoreError>;

    /// Returns entries left active by a previous process to waiting.
    async fn recover_active(&self) -> Result<usize, StoreError>;

    async fn prune_finished(&self, before: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Insert or replace the recurring entry keyed by `entry.job_id`.
    async fn upsert_recurring(&self, entry: &RecurringEntry) -> Result<(), StoreError>;

    async fn remove_recurring(&self, job_id: &str) -> Result<bool, StoreError>;

    async fn get_recurring(&self, job_id: &str) -> Result<Option<RecurringEntry>, StoreError>;

    async fn list_recurring(&self) -> Result<Vec<RecurringEntry>, StoreError>;

    async fn due_recurring(&self, now: DateTime<Utc>) -> Result<Vec<RecurringEntry>, StoreError>;

    async fn advance_recurring(&self, job_id: &str, next_run_at: DateTime<Utc>) -> Result<bool, StoreError>;
}

/// The four store roles the engine consumes, usually backed by one database.
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub modules: Arc<dyn ModuleRegistry>,
    pub executions: Arc<dyn ExecutionStore>,
    pub queue: Arc<dyn QueueStore>,
}

impl Stores {
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: JobStore + ModuleRegistry + ExecutionStore + QueueStore + 'static,
    {
        Self {
            jobs: backend.clone(),
            modules: backend.clone(),
            executions: backend.clone(),
            queue: backend,
        }
    }
}

// ---------------------------------------------------------------------------
// Collaborators handed to handlers
// ---------------------------------------------------------------------------

/// SQL access for handlers. Rows come back as JSON objects keyed by column.
#[async_trait]
pub trait Database: Send + Sync {
    async fn query(&self, sql: &str, params: &[serde_json::Value]) -> anyhow::Result<Vec<serde_json::Value>>;

    /// Returns the number of affected rows.
    async fn execute(&self, sql: &str, params: &[serde_json::Value]) -> anyhow::Result<usize>;
}

/// Outbound notifications (email, SMS, webhook, ...).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, channel: &str, recipient: &str, message: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: HashMap::new(),
            body: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn send(&self, request: HttpRequest) -> anyhow::Result<HttpResponse>;
}
