//! Turns due recurring entries into queue entries, and prunes old ones.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobforge_core::{EngineError, JobStore, TriggerKind};

use crate::cron_parser::next_run;
use crate::cron_scheduler::CronScheduler;
use crate::queue::JobQueue;
use crate::retry::RetryPolicy;

const PRUNE_EVERY: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub dispatched: usize,
    /// Due entries advanced without a dispatch (disabled or missing job).
    pub skipped: usize,
}

pub struct RecurringTicker {
    jobs: Arc<dyn JobStore>,
    queue: Arc<JobQueue>,
    scheduler: Arc<CronScheduler>,
    retry: RetryPolicy,
    default_priority: i32,
    retention: Duration,
    last_prune: Mutex<Option<Instant>>,
}

impl RecurringTicker {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        queue: Arc<JobQueue>,
        scheduler: Arc<CronScheduler>,
        retry: RetryPolicy,
        default_priority: i32,
        retention: Duration,
    ) -> Self {
        Self {
            jobs,
            queue,
            scheduler,
            retry,
            default_priority,
            retention,
            last_prune: Mutex::new(None),
        }
    }

    /// Dispatch every recurring entry due at `now`.
    ///
    /// The next fire time is computed from `now`, not from the missed slot, so
    /// runs missed while the engine was down fire once rather than replaying.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, EngineError> {
        let due = self.queue.store().due_recurring(now).await?;
        let mut report = TickReport::default();

        for entry in due {
            let job_id = entry.job_id.as_str();
            match self.jobs.get_job(job_id).await {
                Ok(Some(job)) if job.enabled => {
                    let max_attempts = self.retry.max_attempts_for(&job);
                    match self
                        .queue
                        .enqueue(&job, TriggerKind::Schedule, self.default_priority, max_attempts)
                        .await
                    {
                        Ok(dispatch_id) => {
                            debug!(job_id = %job_id, dispatch_id = %dispatch_id, "Scheduled run dispatched");
                            report.dispatched += 1;
                        }
                        Err(e) => {
                            // Left due; the next tick tries again.
                            error!(job_id = %job_id, error = %e, "Failed to dispatch scheduled run");
                            continue;
                        }
                    }
                }
                Ok(Some(_)) => {
                    debug!(job_id = %job_id, "Job disabled; skipping scheduled run");
                    report.skipped += 1;
                }
                Ok(None) => {
                    warn!(job_id = %job_id, "Recurring entry has no job; awaiting reconciliation");
                    report.skipped += 1;
                }
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "Failed to read job for scheduled run");
                    continue;
                }
            }

            let next = next_run(&entry.cron, &entry.timezone, now);
            if let Err(e) = self.queue.store().advance_recurring(job_id, next).await {
                error!(job_id = %job_id, error = %e, "Failed to advance recurring entry");
                continue;
            }
            if let Err(e) = self.scheduler.sync_next_run(job_id, next).await {
                warn!(job_id = %job_id, error = %e, "Failed to mirror next run onto schedule");
            }
        }

        Ok(report)
    }

    /// Drop finished queue entries older than the retention window, at most once an hour.
    pub async fn maybe_prune(&self, now: DateTime<Utc>) -> Result<Option<usize>, EngineError> {
        let mut last = self.last_prune.lock().await;
        if last.is_some_and(|at| at.elapsed() < PRUNE_EVERY) {
            return Ok(None);
        }
        *last = Some(Instant::now());
        let cutoff = chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let pruned = self.queue.store().prune_finished(cutoff).await?;
        if pruned > 0 {
            info!(pruned, "Pruned finished queue entries");
        }
        Ok(Some(pruned))
    }

    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        info!(interval_ms = interval.as_millis() as u64, "Recurring ticker started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let now = Utc::now();
                    match self.tick(now).await {
                        Ok(report) if report.dispatched > 0 => {
                            debug!(dispatched = report.dispatched, skipped = report.skipped, "Tick dispatched runs");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Recurring tick failed"),
                    }
                    if let Err(e) = self.maybe_prune(now).await {
                        error!(error = %e, "Queue pruning failed");
                    }
                }
            }
        }
        info!("Recurring ticker stopped");
    }
}
