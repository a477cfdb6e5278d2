use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use jobforge_core::{ConfigMap, Job, JobSchedule, JobStore, Module, ModuleRegistry, StoreError};

use crate::{db_err, from_text, parse_json, to_json, to_text, SqliteStore};

type JobRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    bool,
    i64,
    Option<i64>,
    String,
    String,
    String,
);

fn job_from_row(row: JobRow) -> Result<Job, StoreError> {
    let (id, name, module_id, handler, schedule, enabled, timeout_ms, retries, config, created, updated) =
        row;
    Ok(Job {
        id,
        name,
        module_id,
        handler,
        schedule,
        enabled,
        timeout_ms: timeout_ms.max(0) as u64,
        retries: retries.map(|r| r.max(0) as u32),
        config: parse_json::<ConfigMap>(&config, "job config")?,
        created_at: from_text(&created)?,
        updated_at: from_text(&updated)?,
    })
}

#[async_trait]
impl ModuleRegistry for SqliteStore {
    async fn get_module(&self, id: &str) -> Result<Option<Module>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT id, name, root_dir, enabled, config FROM modules WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        row.map(|(id, name, root_dir, enabled, config)| {
            Ok(Module {
                id,
                name,
                root_dir: PathBuf::from(root_dir),
                enabled,
                config: parse_json(&config, "module config")?,
            })
        })
        .transpose()
    }

    async fn upsert_module(&self, module: &Module) -> Result<(), StoreError> {
        let config = to_json(&module.config)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO modules (id, name, root_dir, enabled, config)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name,
               root_dir = excluded.root_dir,
               enabled = excluded.enabled,
               config = excluded.config",
            params![
                module.id,
                module.name,
                module.root_dir.to_string_lossy(),
                module.enabled,
                config,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT id, name, module_id, handler, schedule, enabled, timeout_ms, retries,
                        config, created_at, updated_at
                 FROM jobs WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                        row.get(9)?,
                        row.get(10)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;
        row.map(job_from_row).transpose()
    }

    async fn list_job_ids(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT id FROM jobs ORDER BY id").map_err(db_err)?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(ids)
    }

    async fn upsert_job(&self, job: &Job) -> Result<(), StoreError> {
        let config = to_json(&job.config)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO jobs (id, name, module_id, handler, schedule, enabled, timeout_ms,
                               retries, config, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name,
               module_id = excluded.module_id,
               handler = excluded.handler,
               schedule = excluded.schedule,
               enabled = excluded.enabled,
               timeout_ms = excluded.timeout_ms,
               retries = excluded.retries,
               config = excluded.config,
               updated_at = excluded.updated_at",
            params![
                job.id,
                job.name,
                job.module_id,
                job.handler,
                job.schedule,
                job.enabled,
                job.timeout_ms as i64,
                job.retries.map(|r| r as i64),
                config,
                to_text(&job.created_at),
                to_text(&job.updated_at),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete_job(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let n = conn
            .execute("DELETE FROM jobs WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(n > 0)
    }

    async fn get_schedule(&self, job_id: &str) -> Result<Option<JobSchedule>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT job_id, cron, timezone, enabled, last_run, next_run
                 FROM job_schedules WHERE job_id = ?1",
                params![job_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        row.map(|(job_id, cron, timezone, enabled, last_run, next_run)| {
            Ok(JobSchedule {
                job_id,
                cron,
                timezone,
                enabled,
                last_run: last_run.as_deref().map(from_text).transpose()?,
                next_run: next_run.as_deref().map(from_text).transpose()?,
            })
        })
        .transpose()
    }

    async fn upsert_schedule(&self, schedule: &JobSchedule) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO job_schedules (job_id, cron, timezone, enabled, last_run, next_run)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(job_id) DO UPDATE SET
               cron = excluded.cron,
               timezone = excluded.timezone,
               enabled = excluded.enabled,
               last_run = COALESCE(excluded.last_run, job_schedules.last_run),
               next_run = excluded.next_run",
            params![
                schedule.job_id,
                schedule.cron,
                schedule.timezone,
                schedule.enabled,
                schedule.last_run.as_ref().map(to_text),
                schedule.next_run.as_ref().map(to_text),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn set_schedule_enabled(&self, job_id: &str, enabled: bool) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let n = conn
            .execute(
                "UPDATE job_schedules SET enabled = ?1 WHERE job_id = ?2",
                params![enabled, job_id],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    async fn record_schedule_run(
        &self,
        job_id: &str,
        last_run: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE job_schedules SET last_run = ?1, next_run = ?2 WHERE job_id = ?3",
            params![to_text(&last_run), to_text(&next_run), job_id],
        )
        .map_err(db_err)?;
        Ok(())
    }
}
