//! Handler loading and execution for JobForge.
//!
//! The loader validates a job's handler path against its module root and
//! caches what the resolver returns; the executor runs one invocation under a
//! deadline, buffering its log lines and persisting the outcome on every path.

pub mod context;
pub mod executor;
pub mod handler;
pub mod loader;
pub mod log_buffer;
pub mod path_guard;
pub mod resolver;

pub use context::{
    merge_config, ExecutionContext, LogNotifier, ReqwestHttpClient, Services, UnavailableDatabase,
};
pub use executor::{status_for, ExecutionRequest, JobExecutor};
pub use handler::{handler_fn, Handler, SharedHandler};
pub use loader::HandlerLoader;
pub use log_buffer::{JobLogger, LogBuffers, LogLevel, LogLine};
pub use path_guard::validate_handler_path;
pub use resolver::{HandlerLocation, HandlerResolver, ProcessHandler, ProcessResolver, RegistryResolver};
