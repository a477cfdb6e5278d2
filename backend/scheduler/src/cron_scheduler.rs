//! Keeps schedule rows and recurring queue registrations in step.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use jobforge_core::{
    EngineError, JobSchedule, JobStore, QueueStore, RecurringEntry, DEFAULT_TIMEZONE,
};

use crate::cron_parser::{next_run, parse_schedule, try_next_run, validate_timezone};

pub struct CronScheduler {
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn QueueStore>,
}

impl CronScheduler {
    pub fn new(jobs: Arc<dyn JobStore>, queue: Arc<dyn QueueStore>) -> Self {
        Self { jobs, queue }
    }

    /// Persist the schedule row and register (or replace) the job's recurring entry.
    pub async fn schedule(
        &self,
        job_id: &str,
        cron: &str,
        timezone: &str,
    ) -> Result<JobSchedule, EngineError> {
        parse_schedule(cron)?;
        validate_timezone(timezone)?;
        let next = try_next_run(cron, timezone, Utc::now())?;

        let last_run = self.jobs.get_schedule(job_id).await?.and_then(|s| s.last_run);
        let schedule = JobSchedule {
            job_id: job_id.to_string(),
            cron: cron.to_string(),
            timezone: timezone.to_string(),
            enabled: true,
            last_run,
            next_run: Some(next),
        };
        self.jobs.upsert_schedule(&schedule).await?;
        self.queue
            .upsert_recurring(&RecurringEntry {
                job_id: job_id.to_string(),
                cron: cron.to_string(),
                timezone: timezone.to_string(),
                next_run_at: next,
            })
            .await?;

        info!(job_id = %job_id, cron = %cron, timezone = %timezone, next_run = %next, "Job scheduled");
        Ok(schedule)
    }

    /// Drop the recurring entry and disable (not delete) the schedule row.
    /// Returns whether a live registration was removed.
    pub async fn unschedule(&self, job_id: &str) -> Result<bool, EngineError> {
        let removed = self.queue.remove_recurring(job_id).await?;
        self.jobs.set_schedule_enabled(job_id, false).await?;
        info!(job_id = %job_id, removed, "Job unscheduled");
        Ok(removed)
    }

    /// Register `cron` for a job, keeping the timezone of its stored row (UTC when new).
    pub async fn reschedule(&self, job_id: &str, cron: &str) -> Result<JobSchedule, EngineError> {
        let timezone = self
            .jobs
            .get_schedule(job_id)
            .await?
            .map(|s| s.timezone)
            .unwrap_or_else(|| DEFAULT_TIMEZONE.to_string());
        self.schedule(job_id, cron, &timezone).await
    }

    /// After a successful run: `lastRun = ran_at`, and `nextRun` mirrors the live
    /// recurring entry, which the ticker owns. Without one it is computed from `ran_at`.
    /// Jobs without an enabled schedule are left alone.
    pub async fn record_run(
        &self,
        job_id: &str,
        ran_at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, EngineError> {
        let Some(schedule) = self.jobs.get_schedule(job_id).await? else {
            return Ok(None);
        };
        if !schedule.enabled {
            return Ok(None);
        }
        let next = match self.queue.get_recurring(job_id).await? {
            Some(entry) => entry.next_run_at,
            None => next_run(&schedule.cron, &schedule.timezone, ran_at),
        };
        self.jobs.record_schedule_run(job_id, ran_at, next).await?;
        debug!(job_id = %job_id, next_run = %next, "Schedule run recorded");
        Ok(Some(next))
    }

    /// Mirror a recurring entry's new fire time onto the schedule row.
    pub async fn sync_next_run(&self, job_id: &str, next: DateTime<Utc>) -> Result<(), EngineError> {
        if let Some(mut schedule) = self.jobs.get_schedule(job_id).await? {
            schedule.next_run = Some(next);
            self.jobs.upsert_schedule(&schedule).await?;
        }
        Ok(())
    }
}
