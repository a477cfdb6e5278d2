use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use jobforge_core::{
    CancelOutcome, EngineError, ExecutionStatus, ExecutionStore, HandlerLoadError, Job,
    JobExecution, JobStore, Module, ModuleRegistry, QueueEntry, QueuePayload, QueueStore, RecurringEntry,
    TriggerKind,
};
use jobforge_executor::{handler_fn, ExecutionContext, RegistryResolver, Services};
use jobforge_scheduler::{Engine, EngineSettings, RetryPolicy, INTERRUPTED_ERROR};
use jobforge_store::SqliteStore;

struct Fixture {
    engine: Engine,
    store: Arc<SqliteStore>,
    registry: Arc<RegistryResolver>,
    _root: tempfile::TempDir,
}

fn settings() -> EngineSettings {
    EngineSettings {
        concurrency: 2,
        poll_interval: Duration::from_millis(20),
        tick_interval: Duration::from_millis(20),
        default_priority: 0,
        default_timeout: Duration::from_secs(5),
        finished_retention: Duration::from_secs(3600),
        exclusive_jobs: false,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 10,
            multiplier: 2.0,
            max_delay_ms: 100,
        },
    }
}

async fn fixture_with(settings: EngineSettings) -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let registry = Arc::new(RegistryResolver::new());
    let engine = Engine::new(
        settings,
        store.clone().into_stores(),
        Services::default(),
        registry.clone(),
    );
    engine
        .register_module(Module::new("m1", "Reports", root.path()))
        .await
        .unwrap();
    Fixture {
        engine,
        store,
        registry,
        _root: root,
    }
}

async fn fixture() -> Fixture {
    fixture_with(settings()).await
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn finished_runs(store: &SqliteStore, job_id: &str) -> Vec<JobExecution> {
    store
        .list_executions(job_id, 50)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.status.is_terminal())
        .collect()
}

#[tokio::test]
async fn schedule_then_unschedule_leaves_disabled_row() {
    let f = fixture().await;
    f.engine.register_job(Job::new("j1", "Digest", "m1", "digest.sh")).await.unwrap();

    f.engine.schedule_job("j1", "*/5 * * * *", None).await.unwrap();
    assert_eq!(f.store.list_recurring().await.unwrap().len(), 1);
    let job = f.store.get_job("j1").await.unwrap().unwrap();
    assert_eq!(job.schedule.as_deref(), Some("*/5 * * * *"));

    assert!(f.engine.unschedule("j1").await.unwrap());
    assert!(f.store.list_recurring().await.unwrap().is_empty());
    let row = f.engine.job_schedule("j1").await.unwrap().unwrap();
    assert!(!row.enabled);
    assert_eq!(row.timezone, "UTC");
}

#[tokio::test]
async fn reconcile_removes_exactly_the_orphan() {
    let f = fixture().await;
    for id in ["a", "b"] {
        f.engine.register_job(Job::new(id, id, "m1", "run.sh")).await.unwrap();
    }
    for id in ["a", "b", "gone"] {
        f.store
            .upsert_recurring(&RecurringEntry {
                job_id: id.to_string(),
                cron: "0 * * * *".to_string(),
                timezone: "UTC".to_string(),
                next_run_at: Utc::now() + chrono::Duration::hours(1),
            })
            .await
            .unwrap();
    }

    assert_eq!(f.engine.reconcile_orphans().await.unwrap().removed_count, 1);
    assert_eq!(f.engine.reconcile_orphans().await.unwrap().removed_count, 0);
}

#[tokio::test]
async fn register_job_rejects_bad_input() {
    let f = fixture().await;

    let err = f
        .engine
        .register_job(Job::new("j1", "Escape", "m1", "../../etc/passwd"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::HandlerLoad(HandlerLoadError::Traversal(_))));

    let mut job = Job::new("j2", "Bad cron", "m1", "run.sh");
    job.schedule = Some("bogus".into());
    let err = f.engine.register_job(job).await.unwrap_err();
    assert!(matches!(err, EngineError::ScheduleInvalid(_)));
    assert_eq!(err.status_code(), 400);

    let err = f
        .engine
        .register_job(Job::new("j3", "Orphan", "nope", "run.sh"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ModuleNotFound(_)));

    assert!(f.store.list_job_ids().await.unwrap().is_empty());
    assert!(f.store.list_recurring().await.unwrap().is_empty());
}

#[tokio::test]
async fn registering_scheduled_job_registers_recurring_entry() {
    let f = fixture().await;
    let mut job = Job::new("j1", "Nightly", "m1", "nightly.sh");
    job.schedule = Some("0 2 * * *".into());
    f.engine.register_job(job.clone()).await.unwrap();
    assert_eq!(f.store.list_recurring().await.unwrap().len(), 1);

    f.engine.set_job_enabled("j1", false).await.unwrap();
    assert!(f.store.list_recurring().await.unwrap().is_empty());
    f.engine.set_job_enabled("j1", true).await.unwrap();
    assert_eq!(f.store.list_recurring().await.unwrap().len(), 1);

    f.engine.delete_job("j1").await.unwrap();
    assert!(f.store.list_recurring().await.unwrap().is_empty());
    assert!(matches!(
        f.engine.delete_job("j1").await,
        Err(EngineError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn reenabling_manual_only_job_does_not_restore_old_cron() {
    let f = fixture().await;
    let mut job = Job::new("j1", "Digest", "m1", "digest.sh");
    job.schedule = Some("*/5 * * * *".into());
    f.engine.register_job(job.clone()).await.unwrap();
    assert_eq!(f.store.list_recurring().await.unwrap().len(), 1);

    job.schedule = None;
    f.engine.register_job(job).await.unwrap();
    f.engine.set_job_enabled("j1", false).await.unwrap();
    let enabled = f.engine.set_job_enabled("j1", true).await.unwrap();

    assert!(enabled.enabled);
    assert!(enabled.schedule.is_none());
    assert!(f.store.list_recurring().await.unwrap().is_empty());
    assert!(!f.engine.job_schedule("j1").await.unwrap().unwrap().enabled);
}

#[tokio::test]
async fn reenabling_uses_current_cron_and_stored_timezone() {
    let f = fixture().await;
    f.engine.register_job(Job::new("j1", "Digest", "m1", "digest.sh")).await.unwrap();
    f.engine
        .schedule_job("j1", "0 * * * *", Some("Europe/Paris"))
        .await
        .unwrap();

    f.engine.set_job_enabled("j1", false).await.unwrap();
    f.engine.set_job_enabled("j1", true).await.unwrap();

    let recurring = f.store.list_recurring().await.unwrap();
    assert_eq!(recurring.len(), 1);
    assert_eq!(recurring[0].cron, "0 * * * *");
    assert_eq!(recurring[0].timezone, "Europe/Paris");
}

#[tokio::test]
async fn manual_run_completes_with_logs() {
    let f = fixture().await;
    f.registry.register(
        "report.sh",
        handler_fn(|ctx: ExecutionContext| async move {
            ctx.logger.info("building report");
            Ok(json!({ "rows": 3, "attempt": ctx.attempt }))
        }),
    );
    f.engine.register_job(Job::new("j1", "Report", "m1", "report.sh")).await.unwrap();
    f.engine.start().await.unwrap();

    let dispatch_id = f.engine.enqueue("j1", TriggerKind::Manual).await.unwrap();
    wait_for("report to complete", || async {
        !finished_runs(&f.store, "j1").await.is_empty()
    })
    .await;

    let run = &f.engine.executions("j1", 10).await.unwrap()[0];
    assert_eq!(run.status, ExecutionStatus::Completed);
    assert_eq!(run.dispatch_id.as_deref(), Some(dispatch_id.as_str()));
    assert_eq!(run.trigger, TriggerKind::Manual);
    assert_eq!(run.result, Some(json!({ "rows": 3, "attempt": 1 })));
    assert!(run.logs.contains("building report"));
    assert!(f.engine.log_buffers().is_empty());

    let fetched = f.engine.execution(&run.id).await.unwrap().unwrap();
    assert_eq!(fetched.id, run.id);

    wait_for("queue entry to settle", || async {
        f.engine.metrics().await.unwrap().completed == 1
    })
    .await;
    assert_eq!(f.engine.metrics().await.unwrap().workers, 2);
    assert_eq!(f.engine.cached_handlers().await, 1);

    f.engine.shutdown().await;
}

#[tokio::test]
async fn failed_attempt_is_retried_with_new_record() {
    let f = fixture().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    f.registry.register(
        "flaky.sh",
        handler_fn(move |_ctx: ExecutionContext| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err::<Value, _>(anyhow::anyhow!("first attempt fails"))
                } else {
                    Ok(json!("ok"))
                }
            }
        }),
    );
    f.engine.register_job(Job::new("j1", "Flaky", "m1", "flaky.sh")).await.unwrap();
    f.engine.start().await.unwrap();
    f.engine.enqueue("j1", TriggerKind::Manual).await.unwrap();

    wait_for("retry to succeed", || async {
        finished_runs(&f.store, "j1")
            .await
            .iter()
            .any(|r| r.status == ExecutionStatus::Completed)
    })
    .await;

    let mut runs = finished_runs(&f.store, "j1").await;
    runs.sort_by_key(|r| r.attempt);
    assert_eq!(runs.len(), 2);
    assert_eq!((runs[0].attempt, runs[0].status), (1, ExecutionStatus::Failed));
    assert_eq!(runs[0].error.as_deref(), Some("handler failed: first attempt fails"));
    assert_eq!((runs[1].attempt, runs[1].status), (2, ExecutionStatus::Completed));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    f.engine.shutdown().await;
}

#[tokio::test]
async fn timeout_is_recorded_and_not_retried() {
    let f = fixture().await;
    f.registry.register(
        "stuck.sh",
        handler_fn(|_ctx: ExecutionContext| async move {
            std::future::pending::<()>().await;
            Ok(Value::Null)
        }),
    );
    let mut job = Job::new("j1", "Stuck", "m1", "stuck.sh");
    job.timeout_ms = 100;
    f.engine.register_job(job).await.unwrap();
    f.engine.start().await.unwrap();
    f.engine.enqueue("j1", TriggerKind::Manual).await.unwrap();

    wait_for("timeout to be recorded", || async {
        !finished_runs(&f.store, "j1").await.is_empty()
    })
    .await;
    wait_for("queue entry to fail", || async {
        f.engine.metrics().await.unwrap().failed == 1
    })
    .await;

    let runs = finished_runs(&f.store, "j1").await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, ExecutionStatus::Timeout);
    assert!(f.engine.log_buffers().is_empty());

    f.engine.shutdown().await;
}

#[tokio::test]
async fn scheduled_run_fires_once_and_records_last_run() {
    let f = fixture().await;
    f.registry
        .register("tick.sh", handler_fn(|_ctx: ExecutionContext| async move { Ok(json!("tick")) }));
    f.engine.register_job(Job::new("j1", "Yearly", "m1", "tick.sh")).await.unwrap();
    f.engine.schedule_job("j1", "0 0 1 1 *", Some("UTC")).await.unwrap();
    // Pretend the engine was down through the last few fire times.
    f.store
        .advance_recurring("j1", Utc::now() - chrono::Duration::days(3))
        .await
        .unwrap();

    f.engine.start().await.unwrap();
    wait_for("scheduled run", || async {
        !finished_runs(&f.store, "j1").await.is_empty()
    })
    .await;
    wait_for("schedule row update", || async {
        f.engine
            .job_schedule("j1")
            .await
            .unwrap()
            .is_some_and(|s| s.last_run.is_some())
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let runs = f.engine.executions("j1", 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].trigger, TriggerKind::Schedule);
    let row = f.engine.job_schedule("j1").await.unwrap().unwrap();
    assert!(row.next_run.unwrap() > Utc::now());

    f.engine.shutdown().await;
}

#[tokio::test]
async fn cancel_before_start_removes_entry() {
    let f = fixture().await;
    f.engine.register_job(Job::new("j1", "Later", "m1", "run.sh")).await.unwrap();
    let dispatch_id = f.engine.enqueue("j1", TriggerKind::Manual).await.unwrap();

    assert_eq!(f.engine.cancel(&dispatch_id).await.unwrap(), CancelOutcome::Removed);
    assert_eq!(
        f.engine.cancel(&dispatch_id).await.unwrap(),
        CancelOutcome::AlreadyFinished
    );
    assert!(matches!(
        f.engine.cancel("missing").await,
        Err(EngineError::DispatchNotFound(_))
    ));
    assert_eq!(f.engine.metrics().await.unwrap().waiting, 0);
}

#[tokio::test]
async fn enqueue_unknown_job_is_not_found() {
    let f = fixture().await;
    let err = f.engine.enqueue("ghost", TriggerKind::Manual).await.unwrap_err();
    assert!(matches!(err, EngineError::JobNotFound(_)));
    assert_eq!(err.status_code(), 404);
}

#[tokio::test]
async fn disabled_job_can_still_be_run_by_hand() {
    let f = fixture().await;
    f.registry
        .register("run.sh", handler_fn(|_ctx: ExecutionContext| async move { Ok(Value::Null) }));
    let mut job = Job::new("j1", "Paused", "m1", "run.sh");
    job.enabled = false;
    f.engine.register_job(job).await.unwrap();
    f.engine.start().await.unwrap();

    f.engine.enqueue("j1", TriggerKind::Manual).await.unwrap();
    wait_for("manual run of disabled job", || async {
        !finished_runs(&f.store, "j1").await.is_empty()
    })
    .await;
    f.engine.shutdown().await;
}

#[tokio::test]
async fn startup_recovers_interrupted_work() {
    let f = fixture().await;
    f.registry
        .register("run.sh", handler_fn(|_ctx: ExecutionContext| async move { Ok(json!("resumed")) }));
    let job = f.engine.register_job(Job::new("j1", "Resume", "m1", "run.sh")).await.unwrap();

    // A previous process claimed this entry and died mid-run.
    let entry = QueueEntry::new(QueuePayload::from(&job), TriggerKind::Manual, 0, 1);
    f.store.push(&entry).await.unwrap();
    f.store.claim_next(Utc::now() + chrono::Duration::seconds(1)).await.unwrap().unwrap();
    let stale = JobExecution::running("j1", Some(entry.id.clone()), TriggerKind::Manual, 1);
    f.store.create_execution(&stale).await.unwrap();

    let report = f.engine.start().await.unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(report.interrupted, 1);

    let stale = f.engine.execution(&stale.id).await.unwrap().unwrap();
    assert_eq!(stale.status, ExecutionStatus::Failed);
    assert_eq!(stale.error.as_deref(), Some(INTERRUPTED_ERROR));

    wait_for("requeued entry to run", || async {
        f.store
            .list_executions("j1", 10)
            .await
            .unwrap()
            .iter()
            .any(|r| r.status == ExecutionStatus::Completed)
    })
    .await;

    assert!(matches!(f.engine.start().await, Err(EngineError::Config(_))));
    f.engine.shutdown().await;
}

#[tokio::test]
async fn exclusive_jobs_never_overlap() {
    let f = fixture_with(EngineSettings {
        exclusive_jobs: true,
        ..settings()
    })
    .await;
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (cur, pk) = (current.clone(), peak.clone());
    f.registry.register(
        "slow.sh",
        handler_fn(move |_ctx: ExecutionContext| {
            let (cur, pk) = (cur.clone(), pk.clone());
            async move {
                let now = cur.fetch_add(1, Ordering::SeqCst) + 1;
                pk.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                cur.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        }),
    );
    f.engine.register_job(Job::new("j1", "Slow", "m1", "slow.sh")).await.unwrap();
    f.engine.enqueue("j1", TriggerKind::Manual).await.unwrap();
    f.engine.enqueue("j1", TriggerKind::Manual).await.unwrap();
    f.engine.start().await.unwrap();

    wait_for("both runs", || async {
        finished_runs(&f.store, "j1").await.len() == 2
    })
    .await;
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    f.engine.shutdown().await;
}

#[tokio::test]
async fn module_update_invalidates_cached_handlers() {
    let f = fixture().await;
    f.registry
        .register("run.sh", handler_fn(|_ctx: ExecutionContext| async move { Ok(Value::Null) }));
    f.engine.register_job(Job::new("j1", "Cached", "m1", "run.sh")).await.unwrap();
    f.engine.start().await.unwrap();
    f.engine.enqueue("j1", TriggerKind::Manual).await.unwrap();
    wait_for("run", || async { !finished_runs(&f.store, "j1").await.is_empty() }).await;
    assert_eq!(f.engine.cached_handlers().await, 1);

    let module = f.store.get_module("m1").await.unwrap().unwrap();
    f.engine.update_module(module).await.unwrap();
    assert_eq!(f.engine.cached_handlers().await, 0);
    assert!(matches!(
        f.engine.update_module(Module::new("zz", "Missing", "/tmp")).await,
        Err(EngineError::ModuleNotFound(_))
    ));
    assert_eq!(f.engine.invalidate_handler_cache(None).await, 0);
    f.engine.shutdown().await;
}
