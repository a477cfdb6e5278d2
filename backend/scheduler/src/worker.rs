//! Fixed-size worker pool draining the durable queue.
//!
//! Each worker claims one entry at a time, writes the `RUNNING` execution row,
//! loads the handler, runs it through the executor, then settles the queue
//! entry: complete, retry with backoff, or fail.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobforge_core::{
    ConfigMap, EngineError, ExecutionFinish, ExecutionStatus, Job, JobEvent, JobEventKind,
    JobExecution, QueueEntry, Stores,
};
use jobforge_executor::{merge_config, ExecutionRequest, HandlerLoader, JobExecutor, SharedHandler};

use crate::cron_parser::far_future;
use crate::cron_scheduler::CronScheduler;
use crate::queue::JobQueue;
use crate::retry::RetryPolicy;

/// Knobs the dispatcher needs from the engine config.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub poll_interval: Duration,
    /// Used for jobs whose own timeout is zero.
    pub default_timeout: Duration,
    pub exclusive_jobs: bool,
    pub retry: RetryPolicy,
}

/// Everything one worker needs to take an entry from claimed to settled.
pub struct Dispatcher {
    stores: Stores,
    queue: Arc<JobQueue>,
    loader: Arc<HandlerLoader>,
    executor: Arc<JobExecutor>,
    scheduler: Arc<CronScheduler>,
    settings: DispatchSettings,
    running: Mutex<HashMap<String, usize>>,
}

/// Releases a job's running slot when dropped.
struct RunningGuard<'a> {
    running: &'a Mutex<HashMap<String, usize>>,
    job_id: String,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(count) = running.get_mut(&self.job_id) {
            *count -= 1;
            if *count == 0 {
                running.remove(&self.job_id);
            }
        }
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or_else(far_future)
}

impl Dispatcher {
    pub fn new(
        stores: Stores,
        queue: Arc<JobQueue>,
        loader: Arc<HandlerLoader>,
        executor: Arc<JobExecutor>,
        scheduler: Arc<CronScheduler>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            stores,
            queue,
            loader,
            executor,
            scheduler,
            settings,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Jobs with an execution in flight in this engine, with their counts.
    pub fn running_jobs(&self) -> HashMap<String, usize> {
        self.running.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn try_acquire(&self, job_id: &str) -> Option<RunningGuard<'_>> {
        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        let count = running.entry(job_id.to_string()).or_insert(0);
        if self.settings.exclusive_jobs && *count > 0 {
            return None;
        }
        *count += 1;
        Some(RunningGuard {
            running: &self.running,
            job_id: job_id.to_string(),
        })
    }

    /// Claim and fully process one eligible entry. Returns `false` when the queue had nothing due.
    pub async fn run_once(&self, shutdown: &CancellationToken) -> Result<bool, EngineError> {
        let Some(entry) = self.queue.claim(Utc::now()).await? else {
            return Ok(false);
        };
        self.process(entry, shutdown).await;
        Ok(true)
    }

    async fn process(&self, entry: QueueEntry, shutdown: &CancellationToken) {
        let dispatch_id = entry.id.clone();
        let job_id = entry.job_id().to_string();

        let job = match self.stores.jobs.get_job(&job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(dispatch_id = %dispatch_id, job_id = %job_id, "Dispatched job no longer exists");
                self.fail_entry(&dispatch_id, &EngineError::JobNotFound(job_id).to_string())
                    .await;
                return;
            }
            Err(e) => {
                error!(dispatch_id = %dispatch_id, job_id = %job_id, error = %e, "Failed to read job");
                self.fail_entry(&dispatch_id, &e.to_string()).await;
                return;
            }
        };

        let Some(_slot) = self.try_acquire(&job_id) else {
            debug!(dispatch_id = %dispatch_id, job_id = %job_id, "Job already running; deferring");
            let run_at = after(Utc::now(), self.settings.poll_interval);
            if let Err(e) = self.queue.store().defer(&dispatch_id, run_at).await {
                error!(dispatch_id = %dispatch_id, error = %e, "Failed to defer queue entry");
            }
            return;
        };

        let execution = JobExecution::running(
            &job_id,
            Some(dispatch_id.clone()),
            entry.trigger,
            entry.attempts,
        );
        if let Err(e) = self.stores.executions.create_execution(&execution).await {
            error!(dispatch_id = %dispatch_id, job_id = %job_id, error = %e, "Failed to create execution record");
            self.fail_entry(&dispatch_id, &e.to_string()).await;
            return;
        }
        info!(
            dispatch_id = %dispatch_id,
            job_id = %job_id,
            execution_id = %execution.id,
            attempt = entry.attempts,
            trigger = %entry.trigger,
            "Dispatching job"
        );

        let outcome = match self.prepare(&entry).await {
            Ok((handler, config)) => {
                self.executor
                    .execute(ExecutionRequest {
                        execution_id: execution.id.clone(),
                        job_id: job_id.clone(),
                        dispatch_id: Some(dispatch_id.clone()),
                        attempt: entry.attempts,
                        trigger: entry.trigger,
                        handler,
                        config,
                        timeout: self.timeout_for(&job),
                        cancel: shutdown.clone(),
                    })
                    .await
            }
            Err(e) => {
                self.finish_unstarted(&execution, &e).await;
                Err(e)
            }
        };

        self.settle(&entry, outcome).await;
    }

    /// Module lookup, handler load, config merge. Nothing here is retried.
    async fn prepare(&self, entry: &QueueEntry) -> Result<(SharedHandler, ConfigMap), EngineError> {
        let payload = &entry.payload;
        let module = self
            .stores
            .modules
            .get_module(&payload.module_id)
            .await?
            .ok_or_else(|| EngineError::ModuleNotFound(payload.module_id.clone()))?;
        let handler = self.loader.load(&payload.module_id, &payload.handler).await?;
        Ok((handler, merge_config(&module.config, &payload.config)))
    }

    fn timeout_for(&self, job: &Job) -> Duration {
        if job.timeout_ms == 0 {
            self.settings.default_timeout
        } else {
            job.timeout()
        }
    }

    /// Terminal record for a dispatch that never reached the executor.
    async fn finish_unstarted(&self, execution: &JobExecution, error: &EngineError) {
        let now = Utc::now();
        let finish = ExecutionFinish {
            status: ExecutionStatus::Failed,
            completed_at: now,
            result: None,
            error: Some(error.to_string()),
            duration_ms: (now - execution.started_at).num_milliseconds().max(0) as u64,
        };
        warn!(job_id = %execution.job_id, execution_id = %execution.id, error = %error, "Job could not be started");
        if let Err(e) = self.stores.executions.finish_execution(&execution.id, &finish).await {
            error!(execution_id = %execution.id, error = %e, "Failed to persist execution status");
        }
        self.executor.services().events.publish(JobEvent::new(
            JobEventKind::Failed,
            &execution.job_id,
            &execution.id,
            serde_json::json!({ "status": finish.status, "error": error.to_string() }),
        ));
    }

    /// Only handler errors go back to the queue; everything else is final.
    async fn settle(&self, entry: &QueueEntry, outcome: Result<Value, EngineError>) {
        let dispatch_id = &entry.id;
        let job_id = entry.job_id();
        let now = Utc::now();
        let result = match outcome {
            Ok(_) => {
                let completed = self.queue.store().complete(dispatch_id).await;
                if let Err(e) = self.scheduler.record_run(job_id, now).await {
                    error!(job_id = %job_id, error = %e, "Failed to record schedule run");
                }
                completed
            }
            Err(EngineError::HandlerExecution(message))
                if self
                    .settings
                    .retry
                    .should_retry(entry.attempts, entry.max_attempts) =>
            {
                let delay = self.settings.retry.delay_for(entry.attempts);
                info!(
                    dispatch_id = %dispatch_id,
                    job_id = %job_id,
                    attempt = entry.attempts,
                    max_attempts = entry.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Job failed, will retry"
                );
                self.queue
                    .store()
                    .reschedule(dispatch_id, after(now, delay), Some(&message))
                    .await
            }
            Err(e) => {
                warn!(dispatch_id = %dispatch_id, job_id = %job_id, error = %e, "Dispatch failed permanently");
                self.queue.store().fail(dispatch_id, &e.to_string()).await
            }
        };
        if let Err(e) = result {
            error!(dispatch_id = %dispatch_id, job_id = %job_id, error = %e, "Failed to settle queue entry");
        }
    }

    async fn fail_entry(&self, dispatch_id: &str, error: &str) {
        if let Err(e) = self.queue.store().fail(dispatch_id, error).await {
            error!(dispatch_id = %dispatch_id, error = %e, "Failed to mark queue entry failed");
        }
    }
}

/// N workers sharing one dispatcher.
pub struct WorkerPool {
    dispatcher: Arc<Dispatcher>,
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(dispatcher: Arc<Dispatcher>, concurrency: usize) -> Self {
        Self {
            dispatcher,
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn spawn(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.concurrency)
            .map(|worker| {
                let dispatcher = Arc::clone(&self.dispatcher);
                let shutdown = shutdown.clone();
                tokio::spawn(worker_loop(worker, dispatcher, shutdown))
            })
            .collect()
    }
}

async fn worker_loop(worker: usize, dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) {
    info!(worker, "Worker started");
    while !shutdown.is_cancelled() {
        match dispatcher.run_once(&shutdown).await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => error!(worker, error = %e, "Failed to claim queue entry"),
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = dispatcher.queue.wait(dispatcher.settings.poll_interval) => {}
        }
    }
    info!(worker, "Worker stopped");
}
