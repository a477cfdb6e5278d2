//! The engine facade the admin surface and CLI talk to.
//!
//! Owns every piece of shared engine state (queue handle, handler cache, log
//! buffers, worker tasks) so several isolated engines can live in one process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobforge_config::JobForgeConfig;
use jobforge_core::{
    CancelOutcome, EngineError, Job, JobExecution, JobSchedule, Module, Stores, TriggerKind,
    DEFAULT_TIMEZONE,
};
use jobforge_executor::{
    validate_handler_path, HandlerLoader, HandlerResolver, JobExecutor, LogBuffers, Services,
};

use crate::cron_parser::parse_schedule;
use crate::cron_scheduler::CronScheduler;
use crate::queue::{JobQueue, QueueMetrics};
use crate::reconciler::{OrphanReconciler, ReconcileReport};
use crate::retry::RetryPolicy;
use crate::ticker::RecurringTicker;
use crate::worker::{DispatchSettings, Dispatcher, WorkerPool};

/// Error written onto executions a previous process left running.
pub const INTERRUPTED_ERROR: &str = "interrupted: engine restarted";

/// Engine tunables, usually taken from [`JobForgeConfig`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub tick_interval: Duration,
    pub default_priority: i32,
    pub default_timeout: Duration,
    pub finished_retention: Duration,
    pub exclusive_jobs: bool,
    pub retry: RetryPolicy,
}

impl From<&JobForgeConfig> for EngineSettings {
    fn from(config: &JobForgeConfig) -> Self {
        Self {
            concurrency: config.queue.concurrency.max(1),
            poll_interval: config.queue.poll_interval(),
            tick_interval: config.queue.tick_interval(),
            default_priority: config.queue.default_priority,
            default_timeout: config.executor.default_timeout(),
            finished_retention: config.queue.finished_retention(),
            exclusive_jobs: config.queue.exclusive_jobs,
            retry: RetryPolicy::from(&config.retry),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&JobForgeConfig::default())
    }
}

/// What startup recovery found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupReport {
    pub orphans_removed: usize,
    pub requeued: usize,
    pub interrupted: usize,
}

pub struct Engine {
    stores: Stores,
    settings: EngineSettings,
    queue: Arc<JobQueue>,
    scheduler: Arc<CronScheduler>,
    loader: Arc<HandlerLoader>,
    executor: Arc<JobExecutor>,
    reconciler: OrphanReconciler,
    pool: WorkerPool,
    ticker: Arc<RecurringTicker>,
    shutdown: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        stores: Stores,
        services: Services,
        resolver: Arc<dyn HandlerResolver>,
    ) -> Self {
        let queue = Arc::new(JobQueue::new(stores.queue.clone()));
        let scheduler = Arc::new(CronScheduler::new(stores.jobs.clone(), stores.queue.clone()));
        let loader = Arc::new(HandlerLoader::new(stores.modules.clone(), resolver));
        let executor = Arc::new(JobExecutor::new(services, stores.executions.clone()));
        let reconciler = OrphanReconciler::new(stores.jobs.clone(), stores.queue.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            stores.clone(),
            queue.clone(),
            loader.clone(),
            executor.clone(),
            scheduler.clone(),
            DispatchSettings {
                poll_interval: settings.poll_interval,
                default_timeout: settings.default_timeout,
                exclusive_jobs: settings.exclusive_jobs,
                retry: settings.retry.clone(),
            },
        ));
        let pool = WorkerPool::new(dispatcher, settings.concurrency);
        let ticker = Arc::new(RecurringTicker::new(
            stores.jobs.clone(),
            queue.clone(),
            scheduler.clone(),
            settings.retry.clone(),
            settings.default_priority,
            settings.finished_retention,
        ));

        Self {
            stores,
            settings,
            queue,
            scheduler,
            loader,
            executor,
            reconciler,
            pool,
            ticker,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(
        config: &JobForgeConfig,
        stores: Stores,
        services: Services,
        resolver: Arc<dyn HandlerResolver>,
    ) -> Self {
        Self::new(EngineSettings::from(config), stores, services, resolver)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn services(&self) -> &Services {
        self.executor.services()
    }

    pub fn log_buffers(&self) -> &Arc<LogBuffers> {
        self.executor.log_buffers()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Recover from the previous process, then start workers and the ticker.
    pub async fn start(&self) -> Result<StartupReport, EngineError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Config("engine already started".to_string()));
        }

        let report = match self.recover().await {
            Ok(report) => report,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let mut tasks = self.tasks.lock().await;
        tasks.extend(self.pool.spawn(self.shutdown.clone()));
        let ticker = Arc::clone(&self.ticker);
        tasks.push(tokio::spawn(
            ticker.run(self.settings.tick_interval, self.shutdown.clone()),
        ));

        info!(
            workers = self.pool.concurrency(),
            orphans_removed = report.orphans_removed,
            requeued = report.requeued,
            interrupted = report.interrupted,
            "Engine started"
        );
        Ok(report)
    }

    async fn recover(&self) -> Result<StartupReport, EngineError> {
        let orphans = self.reconciler.reconcile().await?;
        let requeued = self.stores.queue.recover_active().await?;
        let interrupted = self.stores.executions.fail_interrupted(INTERRUPTED_ERROR).await?;
        if requeued > 0 || interrupted > 0 {
            warn!(requeued, interrupted, "Recovered work left by a previous process");
        }
        Ok(StartupReport {
            orphans_removed: orphans.removed_count,
            requeued,
            interrupted,
        })
    }

    /// Stop workers and the ticker. Running handlers see their token fire.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.queue.wake_all();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Engine task ended abnormally");
            }
        }
        info!("Engine stopped");
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Queue one run of `job_id`. Disabled jobs may still be run by hand.
    pub async fn enqueue(&self, job_id: &str, trigger: TriggerKind) -> Result<String, EngineError> {
        self.enqueue_with_priority(job_id, trigger, self.settings.default_priority)
            .await
    }

    pub async fn enqueue_with_priority(
        &self,
        job_id: &str,
        trigger: TriggerKind,
        priority: i32,
    ) -> Result<String, EngineError> {
        let job = self.require_job(job_id).await?;
        let max_attempts = self.settings.retry.max_attempts_for(&job);
        self.queue.enqueue(&job, trigger, priority, max_attempts).await
    }

    /// Best-effort: only entries that have not started can be stopped.
    pub async fn cancel(&self, dispatch_id: &str) -> Result<CancelOutcome, EngineError> {
        self.queue.cancel(dispatch_id).await
    }

    pub async fn metrics(&self) -> Result<QueueMetrics, EngineError> {
        self.queue.metrics(self.pool.concurrency()).await
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    pub async fn schedule_job(
        &self,
        job_id: &str,
        cron: &str,
        timezone: Option<&str>,
    ) -> Result<JobSchedule, EngineError> {
        let mut job = self.require_job(job_id).await?;
        let timezone = timezone.unwrap_or(DEFAULT_TIMEZONE);
        let schedule = self.scheduler.schedule(job_id, cron, timezone).await?;
        if job.schedule.as_deref() != Some(cron) {
            job.schedule = Some(cron.to_string());
            job.updated_at = Utc::now();
            self.stores.jobs.upsert_job(&job).await?;
        }
        Ok(schedule)
    }

    /// Remove the live registration; the schedule row stays, disabled.
    pub async fn unschedule(&self, job_id: &str) -> Result<bool, EngineError> {
        self.scheduler.unschedule(job_id).await
    }

    pub async fn job_schedule(&self, job_id: &str) -> Result<Option<JobSchedule>, EngineError> {
        Ok(self.stores.jobs.get_schedule(job_id).await?)
    }

    // -----------------------------------------------------------------------
    // Jobs and modules
    // -----------------------------------------------------------------------

    /// Validate and persist a job, then bring its schedule in line with it.
    pub async fn register_job(&self, mut job: Job) -> Result<Job, EngineError> {
        let module = self
            .stores
            .modules
            .get_module(&job.module_id)
            .await?
            .ok_or_else(|| EngineError::ModuleNotFound(job.module_id.clone()))?;
        validate_handler_path(&module.root_dir, &job.handler)?;
        if let Some(cron) = &job.schedule {
            parse_schedule(cron)?;
        }
        if let Some(existing) = self.stores.jobs.get_job(&job.id).await? {
            job.created_at = existing.created_at;
        }
        if job.timeout_ms == 0 {
            job.timeout_ms = self.settings.default_timeout.as_millis() as u64;
        }
        job.updated_at = Utc::now();
        self.stores.jobs.upsert_job(&job).await?;

        match (&job.schedule, job.enabled) {
            (Some(cron), true) => {
                self.scheduler.reschedule(&job.id, cron).await?;
            }
            _ => {
                self.scheduler.unschedule(&job.id).await?;
            }
        }
        info!(job_id = %job.id, module_id = %job.module_id, "Job registered");
        Ok(job)
    }

    /// Disabling unschedules. Enabling re-registers the job's own cron, if it has one.
    pub async fn set_job_enabled(&self, job_id: &str, enabled: bool) -> Result<Job, EngineError> {
        let mut job = self.require_job(job_id).await?;
        job.enabled = enabled;
        job.updated_at = Utc::now();
        self.stores.jobs.upsert_job(&job).await?;

        match (&job.schedule, enabled) {
            (Some(cron), true) => {
                self.scheduler.reschedule(job_id, cron).await?;
            }
            (None, true) => {
                debug!(job_id = %job_id, "Enabled job has no schedule; left manual-only");
            }
            (_, false) => {
                self.scheduler.unschedule(job_id).await?;
            }
        }
        info!(job_id = %job_id, enabled, "Job enablement changed");
        Ok(job)
    }

    /// Unschedule, then delete. Execution history is left to the store's policy.
    pub async fn delete_job(&self, job_id: &str) -> Result<(), EngineError> {
        self.require_job(job_id).await?;
        self.scheduler.unschedule(job_id).await?;
        if !self.stores.jobs.delete_job(job_id).await? {
            return Err(EngineError::JobNotFound(job_id.to_string()));
        }
        info!(job_id = %job_id, "Job deleted");
        Ok(())
    }

    pub async fn register_module(&self, module: Module) -> Result<Module, EngineError> {
        self.stores.modules.upsert_module(&module).await?;
        self.loader.invalidate_module(&module.id).await;
        info!(module_id = %module.id, root = %module.root_dir.display(), "Module registered");
        Ok(module)
    }

    /// Replace an existing module; its cached handlers are dropped.
    pub async fn update_module(&self, module: Module) -> Result<Module, EngineError> {
        if self.stores.modules.get_module(&module.id).await?.is_none() {
            return Err(EngineError::ModuleNotFound(module.id));
        }
        self.register_module(module).await
    }

    // -----------------------------------------------------------------------
    // Maintenance and history
    // -----------------------------------------------------------------------

    pub async fn reconcile_orphans(&self) -> Result<ReconcileReport, EngineError> {
        self.reconciler.reconcile().await
    }

    /// Clear one module's cached handlers, or all of them. Returns how many were dropped.
    pub async fn invalidate_handler_cache(&self, module_id: Option<&str>) -> usize {
        match module_id {
            Some(id) => self.loader.invalidate_module(id).await,
            None => self.loader.invalidate_all().await,
        }
    }

    pub async fn cached_handlers(&self) -> usize {
        self.loader.cached_count().await
    }

    pub async fn executions(&self, job_id: &str, limit: usize) -> Result<Vec<JobExecution>, EngineError> {
        Ok(self.stores.executions.list_executions(job_id, limit).await?)
    }

    pub async fn execution(&self, execution_id: &str) -> Result<Option<JobExecution>, EngineError> {
        Ok(self.stores.executions.get_execution(execution_id).await?)
    }

    async fn require_job(&self, job_id: &str) -> Result<Job, EngineError> {
        self.stores
            .jobs
            .get_job(job_id)
            .await?
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))
    }
}
