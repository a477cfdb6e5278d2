//! Scheduling and dispatch for JobForge.
//!
//! Cron evaluation, the durable queue front, the worker pool, the recurring
//! ticker, orphan reconciliation, and the [`Engine`] facade tying them together.

pub mod cron_parser;
pub mod cron_scheduler;
pub mod engine;
pub mod queue;
pub mod reconciler;
pub mod retry;
pub mod ticker;
pub mod worker;

pub use cron_parser::{far_future, next_run, try_next_run, validate_expression, validate_timezone};
pub use cron_scheduler::CronScheduler;
pub use engine::{Engine, EngineSettings, StartupReport, INTERRUPTED_ERROR};
pub use queue::{JobQueue, QueueMetrics};
pub use reconciler::{OrphanReconciler, ReconcileReport};
pub use retry::RetryPolicy;
pub use ticker::{RecurringTicker, TickReport};
pub use worker::{DispatchSettings, Dispatcher, WorkerPool};
