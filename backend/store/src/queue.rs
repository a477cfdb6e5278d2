use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use jobforge_core::{
    CancelOutcome, QueueCounts, QueueEntry, QueuePayload, QueueState, QueueStore, RecurringEntry,
    StoreError, TriggerKind,
};

use crate::{db_err, from_millis, parse_json, to_json, SqliteStore};

const SELECT_ENTRY: &str = "SELECT id, payload, trigger_kind, priority, state, run_at, attempts,
        max_attempts, last_error, created_at
 FROM queue_entries";

struct EntryRow {
    id: String,
    payload: String,
    trigger: String,
    priority: i64,
    state: String,
    run_at: i64,
    attempts: i64,
    max_attempts: i64,
    last_error: Option<String>,
    created_at: i64,
}

impl EntryRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            payload: row.get(1)?,
            trigger: row.get(2)?,
            priority: row.get(3)?,
            state: row.get(4)?,
            run_at: row.get(5)?,
            attempts: row.get(6)?,
            max_attempts: row.get(7)?,
            last_error: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_entry(self) -> Result<QueueEntry, StoreError> {
        Ok(QueueEntry {
            payload: parse_json::<QueuePayload>(&self.payload, "queue payload")?,
            trigger: self.trigger.parse::<TriggerKind>().map_err(StoreError::Corrupt)?,
            priority: self.priority as i32,
            state: self.state.parse::<QueueState>().map_err(StoreError::Corrupt)?,
            run_at: from_millis(self.run_at)?,
            attempts: self.attempts.max(0) as u32,
            max_attempts: self.max_attempts.max(1) as u32,
            last_error: self.last_error,
            created_at: from_millis(self.created_at)?,
            id: self.id,
        })
    }
}

fn recurring_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_recurring(
    (job_id, cron, timezone, next_run_at): (String, String, String, i64),
) -> Result<RecurringEntry, StoreError> {
    Ok(RecurringEntry {
        job_id,
        cron,
        timezone,
        next_run_at: from_millis(next_run_at)?,
    })
}

#[async_trait]
impl QueueStore for SqliteStore {
    async fn push(&self, entry: &QueueEntry) -> Result<(), StoreError> {
        let payload = to_json(&entry.payload)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO queue_entries (id, payload, trigger_kind, priority, state, run_at,
                                        attempts, max_attempts, last_error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.id,
                payload,
                entry.trigger.as_str(),
                entry.priority as i64,
                entry.state.as_str(),
                entry.run_at.timestamp_millis(),
                entry.attempts as i64,
                entry.max_attempts as i64,
                entry.last_error,
                entry.created_at.timestamp_millis(),
            ],
        )
        .map_err(db_err)?;
        debug!(dispatch_id = %entry.id, job_id = %entry.job_id(), "Queue entry stored");
        Ok(())
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<QueueEntry>, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(db_err)?;
        let row = tx
            .query_row(
                &format!(
                    "{SELECT_ENTRY} WHERE state = 'waiting' AND run_at <= ?1
                     ORDER BY priority DESC, seq ASC LIMIT 1"
                ),
                params![now.timestamp_millis()],
                EntryRow::read,
            )
            .optional()
            .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE queue_entries SET state = 'active', attempts = attempts + 1 WHERE id = ?1",
            params![row.id],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        let mut entry = row.into_entry()?;
        entry.state = QueueState::Active;
        entry.attempts += 1;
        Ok(Some(entry))
    }

    async fn get_entry(&self, id: &str) -> Result<Option<QueueEntry>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(&format!("{SELECT_ENTRY} WHERE id = ?1"), params![id], EntryRow::read)
            .optional()
            .map_err(db_err)?;
        row.map(EntryRow::into_entry).transpose()
    }

    async fn complete(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE queue_entries SET state = 'completed', finished_at = ?1 WHERE id = ?2",
            params![Utc::now().timestamp_millis(), id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn fail(&self, id: &str, error: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE queue_entries SET state = 'failed', last_error = ?1, finished_at = ?2
             WHERE id = ?3",
            params![error, Utc::now().timestamp_millis(), id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn reschedule(&self, id: &str, run_at: DateTime<Utc>, error: Option<&str>) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE queue_entries
             SET state = 'waiting', run_at = ?1, last_error = COALESCE(?2, last_error)
             WHERE id = ?3",
            params![run_at.timestamp_millis(), error, id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn defer(&self, id: &str, run_at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE queue_entries
             SET state = 'waiting', run_at = ?1, attempts = MAX(attempts - 1, 0)
             WHERE id = ?2 AND state = 'active'",
            params![run_at.timestamp_millis(), id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn cancel(&self, id: &str) -> Result<Option<CancelOutcome>, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(db_err)?;
        let state = tx
            .query_row(
                "SELECT state FROM queue_entries WHERE id = ?1",
                params![id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(db_err)?;

        let Some(state) = state else {
            return Ok(None);
        };
        let outcome = match state.parse::<QueueState>().map_err(StoreError::Corrupt)? {
            QueueState::Waiting => {
                tx.execute(
                    "UPDATE queue_entries SET state = 'cancelled', finished_at = ?1 WHERE id = ?2",
                    params![Utc::now().timestamp_millis(), id],
                )
                .map_err(db_err)?;
                CancelOutcome::Removed
            }
            QueueState::Active => CancelOutcome::AlreadyRunning,
            _ => CancelOutcome::AlreadyFinished,
        };
        tx.commit().map_err(db_err)?;
        Ok(Some(outcome))
    }

    async fn counts(&self, now: DateTime<Utc>) -> Result<QueueCounts, StoreError> {
        let conn = self.conn.lock().await;
        let (waiting, active, completed, failed, delayed) = conn
            .query_row(
                "SELECT
                   COALESCE(SUM(CASE WHEN state = 'waiting' AND run_at <= ?1 THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN state = 'active' THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN state = 'completed' THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN state = 'failed' THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN state = 'waiting' AND run_at > ?1 THEN 1 ELSE 0 END), 0)
                 FROM queue_entries",
                params![now.timestamp_millis()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .map_err(db_err)?;
        Ok(QueueCounts {
            waiting: waiting as u64,
            active: active as u64,
            completed: completed as u64,
            failed: failed as u64,
            delayed: delayed as u64,
        })
    }

    async fn recover_active(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        // The interrupted attempt never reported back; it does not count.
        conn.execute(
            "UPDATE queue_entries
             SET state = 'waiting', attempts = MAX(attempts - 1, 0)
             WHERE state = 'active'",
            [],
        )
        .map_err(db_err)
    }

    async fn prune_finished(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM queue_entries
             WHERE state IN ('completed', 'failed', 'cancelled') AND finished_at < ?1",
            params![before.timestamp_millis()],
        )
        .map_err(db_err)
    }

    async fn upsert_recurring(&self, entry: &RecurringEntry) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO recurring_entries (job_id, cron, timezone, next_run_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(job_id) DO UPDATE SET
               cron = excluded.cron,
               timezone = excluded.timezone,
               next_run_at = excluded.next_run_at",
            params![
                entry.job_id,
                entry.cron,
                entry.timezone,
                entry.next_run_at.timestamp_millis(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn remove_recurring(&self, job_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let n = conn
            .execute("DELETE FROM recurring_entries WHERE job_id = ?1", params![job_id])
            .map_err(db_err)?;
        Ok(n > 0)
    }

    async fn get_recurring(&self, job_id: &str) -> Result<Option<RecurringEntry>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT job_id, cron, timezone, next_run_at FROM recurring_entries WHERE job_id = ?1",
                params![job_id],
                recurring_from_row,
            )
            .optional()
            .map_err(db_err)?;
        row.map(into_recurring).transpose()
    }

    async fn list_recurring(&self) -> Result<Vec<RecurringEntry>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT job_id, cron, timezone, next_run_at FROM recurring_entries ORDER BY job_id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], recurring_from_row)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        rows.into_iter().map(into_recurring).collect()
    }

    async fn due_recurring(&self, now: DateTime<Utc>) -> Result<Vec<RecurringEntry>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT job_id, cron, timezone, next_run_at FROM recurring_entries
                 WHERE next_run_at <= ?1 ORDER BY next_run_at, job_id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![now.timestamp_millis()], recurring_from_row)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        rows.into_iter().map(into_recurring).collect()
    }

    async fn advance_recurring(&self, job_id: &str, next_run_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let n = conn
            .execute(
                "UPDATE recurring_entries SET next_run_at = ?1 WHERE job_id = ?2",
                params![next_run_at.timestamp_millis(), job_id],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use jobforge_core::Job;

    fn entry(job_id: &str, priority: i32) -> QueueEntry {
        let job = Job::new(job_id, job_id, "m1", "run.sh");
        QueueEntry::new(QueuePayload::from(&job), TriggerKind::Manual, priority, 3)
    }

    #[tokio::test]
    async fn claims_by_priority_then_fifo() {
        let store = SqliteStore::in_memory().unwrap();
        let low = entry("low", 0);
        let first_high = entry("high-1", 5);
        let second_high = entry("high-2", 5);
        for e in [&low, &first_high, &second_high] {
            store.push(e).await.unwrap();
        }

        let now = Utc::now() + Duration::seconds(1);
        let order: Vec<String> = [
            store.claim_next(now).await.unwrap().unwrap(),
            store.claim_next(now).await.unwrap().unwrap(),
            store.claim_next(now).await.unwrap().unwrap(),
        ]
        .into_iter()
        .map(|e| e.payload.job_id)
        .collect();
        assert_eq!(order, vec!["high-1", "high-2", "low"]);
        assert!(store.claim_next(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_marks_active_and_counts_attempt() {
        let store = SqliteStore::in_memory().unwrap();
        let e = entry("job-1", 0);
        store.push(&e).await.unwrap();

        let claimed = store.claim_next(Utc::now() + Duration::seconds(1)).await.unwrap().unwrap();
        assert_eq!(claimed.state, QueueState::Active);
        assert_eq!(claimed.attempts, 1);
        let stored = store.get_entry(&e.id).await.unwrap().unwrap();
        assert_eq!(stored.state, QueueState::Active);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn delayed_entries_wait_for_run_at() {
        let store = SqliteStore::in_memory().unwrap();
        let mut e = entry("job-1", 0);
        let now = Utc::now();
        e.run_at = now + Duration::minutes(5);
        store.push(&e).await.unwrap();

        assert!(store.claim_next(now).await.unwrap().is_none());
        let counts = store.counts(now).await.unwrap();
        assert_eq!(counts.delayed, 1);
        assert_eq!(counts.waiting, 0);

        assert!(store.claim_next(now + Duration::minutes(6)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reschedule_returns_entry_to_waiting() {
        let store = SqliteStore::in_memory().unwrap();
        let e = entry("job-1", 0);
        store.push(&e).await.unwrap();
        let now = Utc::now() + Duration::seconds(1);
        store.claim_next(now).await.unwrap().unwrap();

        let later = now + Duration::seconds(30);
        store.reschedule(&e.id, later, Some("boom")).await.unwrap();
        let stored = store.get_entry(&e.id).await.unwrap().unwrap();
        assert_eq!(stored.state, QueueState::Waiting);
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
        assert_eq!(stored.run_at.timestamp_millis(), later.timestamp_millis());
        assert!(store.claim_next(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_outcomes_follow_state() {
        let store = SqliteStore::in_memory().unwrap();
        let waiting = entry("a", 0);
        let running = entry("b", 10);
        let done = entry("c", 0);
        for e in [&waiting, &running, &done] {
            store.push(e).await.unwrap();
        }
        let now = Utc::now() + Duration::seconds(1);
        let claimed = store.claim_next(now).await.unwrap().unwrap();
        assert_eq!(claimed.id, running.id);
        store.fail(&done.id, "nope").await.unwrap();

        assert_eq!(store.cancel(&waiting.id).await.unwrap(), Some(CancelOutcome::Removed));
        assert_eq!(store.cancel(&running.id).await.unwrap(), Some(CancelOutcome::AlreadyRunning));
        assert_eq!(store.cancel(&done.id).await.unwrap(), Some(CancelOutcome::AlreadyFinished));
        assert_eq!(store.cancel("missing").await.unwrap(), None);

        // A cancelled entry is never claimed.
        assert!(store.claim_next(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn counts_by_state() {
        let store = SqliteStore::in_memory().unwrap();
        let entries: Vec<QueueEntry> = (0..4).map(|i| entry(&format!("j{i}"), 0)).collect();
        for e in &entries {
            store.push(e).await.unwrap();
        }
        let now = Utc::now() + Duration::seconds(1);
        let a = store.claim_next(now).await.unwrap().unwrap();
        let b = store.claim_next(now).await.unwrap().unwrap();
        let c = store.claim_next(now).await.unwrap().unwrap();
        store.complete(&a.id).await.unwrap();
        store.fail(&b.id, "x").await.unwrap();

        let counts = store.counts(now).await.unwrap();
        assert_eq!(
            counts,
            QueueCounts { waiting: 1, active: 1, completed: 1, failed: 1, delayed: 0 }
        );
        let _ = c;
    }

    #[tokio::test]
    async fn defer_returns_entry_without_charging_attempt() {
        let store = SqliteStore::in_memory().unwrap();
        let e = entry("job-1", 0);
        store.push(&e).await.unwrap();
        let now = Utc::now() + Duration::seconds(1);
        store.claim_next(now).await.unwrap().unwrap();

        let later = now + Duration::seconds(30);
        store.defer(&e.id, later).await.unwrap();
        let stored = store.get_entry(&e.id).await.unwrap().unwrap();
        assert_eq!(stored.state, QueueState::Waiting);
        assert_eq!(stored.attempts, 0);
        assert!(store.claim_next(now).await.unwrap().is_none());
        assert!(store.claim_next(later).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn recover_active_requeues_without_charging_attempt() {
        let store = SqliteStore::in_memory().unwrap();
        let e = entry("job-1", 0);
        store.push(&e).await.unwrap();
        store.claim_next(Utc::now() + Duration::seconds(1)).await.unwrap().unwrap();

        assert_eq!(store.recover_active().await.unwrap(), 1);
        let stored = store.get_entry(&e.id).await.unwrap().unwrap();
        assert_eq!(stored.state, QueueState::Waiting);
        assert_eq!(stored.attempts, 0);
    }

    #[tokio::test]
    async fn prune_only_removes_old_finished_entries() {
        let store = SqliteStore::in_memory().unwrap();
        let done = entry("done", 0);
        let pending = entry("pending", -1);
        store.push(&done).await.unwrap();
        store.push(&pending).await.unwrap();
        store.claim_next(Utc::now() + Duration::seconds(1)).await.unwrap().unwrap();
        store.complete(&done.id).await.unwrap();

        let removed = store.prune_finished(Utc::now() + Duration::seconds(5)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_entry(&done.id).await.unwrap().is_none());
        assert!(store.get_entry(&pending.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn recurring_entries_are_keyed_by_job() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();
        let mut rec = RecurringEntry {
            job_id: "job-1".into(),
            cron: "*/5 * * * *".into(),
            timezone: "UTC".into(),
            next_run_at: now - Duration::minutes(1),
        };
        store.upsert_recurring(&rec).await.unwrap();
        rec.cron = "0 * * * *".into();
        store.upsert_recurring(&rec).await.unwrap();

        let listed = store.list_recurring().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].cron, "0 * * * *");

        assert_eq!(store.due_recurring(now).await.unwrap().len(), 1);
        assert!(store.advance_recurring("job-1", now + Duration::hours(1)).await.unwrap());
        assert!(store.due_recurring(now).await.unwrap().is_empty());
        let fetched = store.get_recurring("job-1").await.unwrap().unwrap();
        assert_eq!(fetched.cron, "0 * * * *");
        assert!(fetched.next_run_at > now);

        assert!(store.remove_recurring("job-1").await.unwrap());
        assert!(store.get_recurring("job-1").await.unwrap().is_none());
        assert!(!store.remove_recurring("job-1").await.unwrap());
        assert!(!store.advance_recurring("job-1", now).await.unwrap());
    }
}
