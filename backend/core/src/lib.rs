pub mod error;
pub mod event;
pub mod queue;
pub mod traits;
pub mod types;

pub use error::{EngineError, HandlerLoadError, Result, StoreError};
pub use event::{BroadcastEventBus, EventBus, JobEvent, JobEventKind};
pub use queue::{CancelOutcome, QueueCounts, QueueEntry, QueuePayload, QueueState, RecurringEntry};
pub use traits::{
    Database, ExecutionStore, HttpClient, HttpRequest, HttpResponse, JobStore, ModuleRegistry,
    Notifier, QueueStore, Stores,
};
pub use types::{
    ConfigMap, ExecutionFinish, ExecutionStatus, Job, JobExecution, JobSchedule, Module,
    TriggerKind, DEFAULT_TIMEOUT_MS, DEFAULT_TIMEZONE,
};
