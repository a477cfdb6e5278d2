use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form key/value configuration attached to jobs and modules.
pub type ConfigMap = serde_json::Map<String, serde_json::Value>;

/// Default handler deadline when a job does not carry one.
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;

/// Default IANA zone for schedules.
pub const DEFAULT_TIMEZONE: &str = "UTC";

/// An installed module: the directory handler paths are resolved against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    pub id: String,
    pub name: String,
    pub root_dir: PathBuf,
    pub enabled: bool,
    #[serde(default)]
    pub config: ConfigMap,
}

impl Module {
    pub fn new(id: impl Into<String>, name: impl Into<String>, root_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            root_dir: root_dir.into(),
            enabled: true,
            config: ConfigMap::new(),
        }
    }
}

/// A unit of automatable work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub name: String,
    pub module_id: String,
    /// Handler path relative to the owning module's root directory.
    pub handler: String,
    /// Cron expression; `None` means manual-only.
    pub schedule: Option<String>,
    pub enabled: bool,
    pub timeout_ms: u64,
    /// Additional attempts after the first; `None` defers to the engine's retry policy.
    pub retries: Option<u32>,
    #[serde(default)]
    pub config: ConfigMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        module_id: impl Into<String>,
        handler: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            module_id: module_id.into(),
            handler: handler.into(),
            schedule: None,
            enabled: true,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retries: None,
            config: ConfigMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Durable cron binding for a job. One row per job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSchedule {
    pub job_id: String,
    pub cron: String,
    pub timezone: String,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

/// Lifecycle state of one execution record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Timeout => "TIMEOUT",
            ExecutionStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Timeout
                | ExecutionStatus::Cancelled
        )
    }

    /// Status only moves forward: pending → running → terminal.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        match self {
            ExecutionStatus::Pending => next != ExecutionStatus::Pending,
            ExecutionStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ExecutionStatus::Pending),
            "RUNNING" => Ok(ExecutionStatus::Running),
            "COMPLETED" => Ok(ExecutionStatus::Completed),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "TIMEOUT" => Ok(ExecutionStatus::Timeout),
            "CANCELLED" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown execution status '{other}'")),
        }
    }
}

/// What caused a dispatch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Schedule,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Manual => "manual",
            TriggerKind::Schedule => "schedule",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TriggerKind::Manual),
            "schedule" => Ok(TriggerKind::Schedule),
            other => Err(format!("unknown trigger kind '{other}'")),
        }
    }
}

/// Record of one run of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobExecution {
    pub id: String,
    pub job_id: String,
    pub dispatch_id: Option<String>,
    pub status: ExecutionStatus,
    pub trigger: TriggerKind,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
    pub logs: String,
}

impl JobExecution {
    /// A fresh record in `RUNNING`, written before the handler is invoked.
    pub fn running(
        job_id: impl Into<String>,
        dispatch_id: Option<String>,
        trigger: TriggerKind,
        attempt: u32,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.into(),
            dispatch_id,
            status: ExecutionStatus::Running,
            trigger,
            attempt,
            started_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
            duration_ms: None,
            logs: String::new(),
        }
    }
}

/// Terminal data written once when an execution ends.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionFinish {
    pub status: ExecutionStatus,
    pub completed_at: DateTime<Utc>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_moves_forward_only() {
        assert!(ExecutionStatus::Running.can_transition_to(ExecutionStatus::Completed));
        assert!(ExecutionStatus::Running.can_transition_to(ExecutionStatus::Timeout));
        assert!(!ExecutionStatus::Running.can_transition_to(ExecutionStatus::Pending));
        assert!(!ExecutionStatus::Completed.can_transition_to(ExecutionStatus::Failed));
        assert!(!ExecutionStatus::Timeout.can_transition_to(ExecutionStatus::Running));
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Timeout,
            ExecutionStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<ExecutionStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn status_serializes_uppercase() {
        let json = serde_json::to_string(&ExecutionStatus::Timeout).unwrap();
        assert_eq!(json, "\"TIMEOUT\"");
    }

    #[test]
    fn new_job_defaults() {
        let job = Job::new("j1", "Nightly sync", "m1", "handlers/sync.sh");
        assert!(job.enabled);
        assert_eq!(job.timeout(), Duration::from_millis(DEFAULT_TIMEOUT_MS));
        assert!(job.schedule.is_none());
        assert!(job.retries.is_none());
    }
}
