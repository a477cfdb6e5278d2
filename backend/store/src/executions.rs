use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, Row};

use jobforge_core::{ExecutionFinish, ExecutionStatus, ExecutionStore, JobExecution, StoreError, TriggerKind};

use crate::{db_err, from_text, parse_json, to_json, to_text, SqliteStore};

const SELECT_EXECUTION: &str = "SELECT id, job_id, dispatch_id, status, trigger_kind, attempt,
        started_at, completed_at, result, error, duration_ms, logs
 FROM job_executions";

struct ExecutionRow {
    id: String,
    job_id: String,
    dispatch_id: Option<String>,
    status: String,
    trigger: String,
    attempt: i64,
    started_at: String,
    completed_at: Option<String>,
    result: Option<String>,
    error: Option<String>,
    duration_ms: Option<i64>,
    logs: String,
}

impl ExecutionRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_id: row.get(1)?,
            dispatch_id: row.get(2)?,
            status: row.get(3)?,
            trigger: row.get(4)?,
            attempt: row.get(5)?,
            started_at: row.get(6)?,
            completed_at: row.get(7)?,
            result: row.get(8)?,
            error: row.get(9)?,
            duration_ms: row.get(10)?,
            logs: row.get(11)?,
        })
    }

    fn into_execution(self) -> Result<JobExecution, StoreError> {
        Ok(JobExecution {
            status: self
                .status
                .parse::<ExecutionStatus>()
                .map_err(StoreError::Corrupt)?,
            trigger: self.trigger.parse::<TriggerKind>().map_err(StoreError::Corrupt)?,
            attempt: self.attempt.max(0) as u32,
            started_at: from_text(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(from_text).transpose()?,
            result: self
                .result
                .as_deref()
                .map(|raw| parse_json(raw, "execution result"))
                .transpose()?,
            duration_ms: self.duration_ms.map(|d| d.max(0) as u64),
            id: self.id,
            job_id: self.job_id,
            dispatch_id: self.dispatch_id,
            error: self.error,
            logs: self.logs,
        })
    }
}

#[async_trait]
impl ExecutionStore for SqliteStore {
    async fn create_execution(&self, execution: &JobExecution) -> Result<(), StoreError> {
        let result = execution.result.as_ref().map(to_json).transpose()?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO job_executions (id, job_id, dispatch_id, status, trigger_kind, attempt,
                                         started_at, completed_at, result, error, duration_ms, logs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                execution.id,
                execution.job_id,
                execution.dispatch_id,
                execution.status.as_str(),
                execution.trigger.as_str(),
                execution.attempt as i64,
                to_text(&execution.started_at),
                execution.completed_at.as_ref().map(to_text),
                result,
                execution.error,
                execution.duration_ms.map(|d| d as i64),
                execution.logs,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn finish_execution(&self, id: &str, finish: &ExecutionFinish) -> Result<bool, StoreError> {
        if !finish.status.is_terminal() {
            return Err(StoreError::Corrupt(format!(
                "cannot finish execution with non-terminal status {}",
                finish.status
            )));
        }
        let result = finish.result.as_ref().map(to_json).transpose()?;
        let conn = self.conn.lock().await;
        let n = conn
            .execute(
                "UPDATE job_executions
                 SET status = ?1, completed_at = ?2, result = ?3, error = ?4, duration_ms = ?5
                 WHERE id = ?6 AND status IN ('PENDING', 'RUNNING')",
                params![
                    finish.status.as_str(),
                    to_text(&finish.completed_at),
                    result,
                    finish.error,
                    finish.duration_ms as i64,
                    id,
                ],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    async fn append_logs(&self, id: &str, logs: &str) -> Result<(), StoreError> {
        if logs.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE job_executions SET logs = logs || ?1 WHERE id = ?2",
            params![logs, id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<JobExecution>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!("{SELECT_EXECUTION} WHERE id = ?1"),
                params![id],
                ExecutionRow::read,
            )
            .optional()
            .map_err(db_err)?;
        row.map(ExecutionRow::into_execution).transpose()
    }

    async fn list_executions(&self, job_id: &str, limit: usize) -> Result<Vec<JobExecution>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "{SELECT_EXECUTION} WHERE job_id = ?1 ORDER BY started_at DESC, rowid DESC LIMIT ?2"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![job_id, limit as i64], ExecutionRow::read)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        rows.into_iter().map(ExecutionRow::into_execution).collect()
    }

    async fn fail_interrupted(&self, error: &str) -> Result<usize, StoreError> {
        let now = to_text(&chrono::Utc::now());
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE job_executions SET status = 'FAILED', completed_at = ?1, error = ?2
             WHERE status IN ('PENDING', 'RUNNING')",
            params![now, error],
        )
        .map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn finish(status: ExecutionStatus) -> ExecutionFinish {
        ExecutionFinish {
            status,
            completed_at: Utc::now(),
            result: Some(serde_json::json!({"rows": 3})),
            error: None,
            duration_ms: 42,
        }
    }

    #[tokio::test]
    async fn create_then_finish() {
        let store = SqliteStore::in_memory().unwrap();
        let exec = JobExecution::running("job-1", Some("d-1".into()), TriggerKind::Manual, 1);
        store.create_execution(&exec).await.unwrap();

        let loaded = store.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Running);
        assert_eq!(loaded.dispatch_id.as_deref(), Some("d-1"));

        assert!(store
            .finish_execution(&exec.id, &finish(ExecutionStatus::Completed))
            .await
            .unwrap());
        let loaded = store.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert_eq!(loaded.result, Some(serde_json::json!({"rows": 3})));
        assert_eq!(loaded.duration_ms, Some(42));
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn finish_is_write_once() {
        let store = SqliteStore::in_memory().unwrap();
        let exec = JobExecution::running("job-1", None, TriggerKind::Schedule, 1);
        store.create_execution(&exec).await.unwrap();

        assert!(store
            .finish_execution(&exec.id, &finish(ExecutionStatus::Timeout))
            .await
            .unwrap());
        assert!(!store
            .finish_execution(&exec.id, &finish(ExecutionStatus::Completed))
            .await
            .unwrap());
        let loaded = store.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Timeout);
    }

    #[tokio::test]
    async fn finish_rejects_non_terminal_status() {
        let store = SqliteStore::in_memory().unwrap();
        let exec = JobExecution::running("job-1", None, TriggerKind::Manual, 1);
        store.create_execution(&exec).await.unwrap();
        assert!(store
            .finish_execution(&exec.id, &finish(ExecutionStatus::Running))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn logs_append_in_order() {
        let store = SqliteStore::in_memory().unwrap();
        let exec = JobExecution::running("job-1", None, TriggerKind::Manual, 1);
        store.create_execution(&exec).await.unwrap();
        store.append_logs(&exec.id, "first\n").await.unwrap();
        store.append_logs(&exec.id, "").await.unwrap();
        store.append_logs(&exec.id, "second\n").await.unwrap();

        let loaded = store.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.logs, "first\nsecond\n");
    }

    #[tokio::test]
    async fn list_is_newest_first_and_limited() {
        let store = SqliteStore::in_memory().unwrap();
        let mut ids = Vec::new();
        for attempt in 1..=3 {
            let mut exec = JobExecution::running("job-1", None, TriggerKind::Manual, attempt);
            exec.started_at = Utc::now() + chrono::Duration::seconds(attempt as i64);
            store.create_execution(&exec).await.unwrap();
            ids.push(exec.id);
        }
        store
            .create_execution(&JobExecution::running("job-2", None, TriggerKind::Manual, 1))
            .await
            .unwrap();

        let listed = store.list_executions("job-1", 2).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, ids[2]);
        assert_eq!(listed[1].id, ids[1]);
    }

    #[tokio::test]
    async fn interrupted_runs_are_failed_at_startup() {
        let store = SqliteStore::in_memory().unwrap();
        let running = JobExecution::running("job-1", None, TriggerKind::Manual, 1);
        let done = JobExecution::running("job-1", None, TriggerKind::Manual, 1);
        store.create_execution(&running).await.unwrap();
        store.create_execution(&done).await.unwrap();
        store
            .finish_execution(&done.id, &finish(ExecutionStatus::Completed))
            .await
            .unwrap();

        let n = store.fail_interrupted("interrupted: engine restarted").await.unwrap();
        assert_eq!(n, 1);
        let loaded = store.get_execution(&running.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("interrupted: engine restarted"));
        let untouched = store.get_execution(&done.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, ExecutionStatus::Completed);
    }
}
