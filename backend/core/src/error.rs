use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Top-level error type for the JobForge engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid schedule: {0}")]
    ScheduleInvalid(String),

    #[error("module not found: {0}")]
    ModuleNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("dispatch not found: {0}")]
    DispatchNotFound(String),

    #[error("handler load failed: {0}")]
    HandlerLoad(#[from] HandlerLoadError),

    #[error("handler failed: {0}")]
    HandlerExecution(String),

    #[error("handler exceeded timeout of {}ms", .0.as_millis())]
    TimeoutExceeded(Duration),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// HTTP status the admin surface reports for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::ModuleNotFound(_)
            | EngineError::JobNotFound(_)
            | EngineError::DispatchNotFound(_) => 404,
            EngineError::ScheduleInvalid(_) | EngineError::Config(_) => 400,
            EngineError::HandlerLoad(HandlerLoadError::NotFound(_)) => 404,
            EngineError::HandlerLoad(_) => 400,
            EngineError::HandlerExecution(_)
            | EngineError::TimeoutExceeded(_)
            | EngineError::Store(_) => 500,
        }
    }

    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::ScheduleInvalid(_) => "schedule_invalid",
            EngineError::ModuleNotFound(_) => "module_not_found",
            EngineError::JobNotFound(_) => "job_not_found",
            EngineError::DispatchNotFound(_) => "dispatch_not_found",
            EngineError::HandlerLoad(HandlerLoadError::NotFound(_)) => "handler_not_found",
            EngineError::HandlerLoad(HandlerLoadError::Invalid { .. }) => "handler_invalid",
            EngineError::HandlerLoad(HandlerLoadError::Traversal(_)) => "handler_traversal",
            EngineError::HandlerExecution(_) => "handler_execution",
            EngineError::TimeoutExceeded(_) => "timeout_exceeded",
            EngineError::Store(_) => "store_persistence",
            EngineError::Config(_) => "config",
        }
    }
}

/// Failure to turn a job's handler reference into invocable code.
///
/// None of these are retried by the queue.
#[derive(Debug, Error)]
pub enum HandlerLoadError {
    #[error("handler file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("handler at {} is not invocable: {reason}", path.display())]
    Invalid { path: PathBuf, reason: String },

    #[error("handler path escapes module root: {0}")]
    Traversal(String),
}

/// Failure reading or writing the system of record.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Backend(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
