//! Per-execution log buffers.
//!
//! A buffer appears on the first line an execution logs and disappears when the
//! execution is closed, whatever happens to the flush afterwards. Appends and
//! closes share one lock so a late write can never resurrect a closed buffer.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use jobforge_logging::redact_sensitive_data;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.level.as_str(),
            self.message
        )
    }
}

/// Render buffered lines as the text stored on the execution record.
pub fn render(lines: &[LogLine]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(&line.to_string());
        out.push('\n');
    }
    out
}

#[derive(Default)]
pub struct LogBuffers {
    buffers: Mutex<HashMap<String, Vec<LogLine>>>,
}

impl LogBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<LogLine>>> {
        // A panic while holding the lock cannot leave a half-written line.
        self.buffers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hand out the logger for one execution. No buffer exists until it logs.
    pub fn open(self: &Arc<Self>, job_id: &str, execution_id: &str) -> JobLogger {
        JobLogger {
            job_id: job_id.to_string(),
            execution_id: execution_id.to_string(),
            buffers: Arc::clone(self),
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Close the logger and remove its buffer in one step.
    pub fn close(&self, logger: &JobLogger) -> Vec<LogLine> {
        let mut buffers = self.lock();
        logger.open.store(false, Ordering::SeqCst);
        buffers.remove(&logger.execution_id).unwrap_or_default()
    }

    fn append(&self, logger: &JobLogger, line: LogLine) -> bool {
        let mut buffers = self.lock();
        if !logger.open.load(Ordering::SeqCst) {
            return false;
        }
        buffers
            .entry(logger.execution_id.clone())
            .or_default()
            .push(line);
        true
    }

    /// Number of live buffers.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, execution_id: &str) -> bool {
        self.lock().contains_key(execution_id)
    }
}

/// Scoped logger handed to a handler. Lines are redacted, buffered for the
/// execution record while the execution is open, and always mirrored to tracing.
#[derive(Clone)]
pub struct JobLogger {
    job_id: String,
    execution_id: String,
    buffers: Arc<LogBuffers>,
    open: Arc<AtomicBool>,
}

impl JobLogger {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn log(&self, level: LogLevel, message: impl AsRef<str>) {
        let message = redact_sensitive_data(message.as_ref());
        match level {
            LogLevel::Debug => debug!(job_id = %self.job_id, execution_id = %self.execution_id, "{message}"),
            LogLevel::Info => info!(job_id = %self.job_id, execution_id = %self.execution_id, "{message}"),
            LogLevel::Warn => warn!(job_id = %self.job_id, execution_id = %self.execution_id, "{message}"),
            LogLevel::Error => error!(job_id = %self.job_id, execution_id = %self.execution_id, "{message}"),
        }
        self.buffers.append(
            self,
            LogLine {
                timestamp: Utc::now(),
                level,
                message,
            },
        );
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Error, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_is_created_lazily() {
        let buffers = Arc::new(LogBuffers::new());
        let logger = buffers.open("job-1", "exec-1");
        assert!(buffers.is_empty());
        logger.info("hello");
        assert!(buffers.contains("exec-1"));
        assert_eq!(buffers.len(), 1);
    }

    #[test]
    fn close_removes_and_returns_lines_in_order() {
        let buffers = Arc::new(LogBuffers::new());
        let logger = buffers.open("job-1", "exec-1");
        logger.info("one");
        logger.warn("two");

        let lines = buffers.close(&logger);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].message, "one");
        assert_eq!(lines[1].level, LogLevel::Warn);
        assert!(buffers.is_empty());
    }

    #[test]
    fn writes_after_close_do_not_recreate_buffer() {
        let buffers = Arc::new(LogBuffers::new());
        let logger = buffers.open("job-1", "exec-1");
        let late = logger.clone();
        buffers.close(&logger);

        late.error("still running after timeout");
        assert!(!late.is_open());
        assert!(buffers.is_empty());
    }

    #[test]
    fn lines_are_redacted() {
        let buffers = Arc::new(LogBuffers::new());
        let logger = buffers.open("job-1", "exec-1");
        logger.info("login with password=hunter2");
        let lines = buffers.close(&logger);
        assert!(!lines[0].message.contains("hunter2"));
    }

    #[test]
    fn render_one_line_per_entry() {
        let buffers = Arc::new(LogBuffers::new());
        let logger = buffers.open("job-1", "exec-1");
        logger.info("a");
        logger.error("b");
        let text = render(&buffers.close(&logger));
        let rendered: Vec<&str> = text.lines().collect();
        assert_eq!(rendered.len(), 2);
        assert!(rendered[0].ends_with("[INFO] a"));
        assert!(rendered[1].ends_with("[ERROR] b"));
    }

    #[test]
    fn executions_do_not_share_buffers() {
        let buffers = Arc::new(LogBuffers::new());
        let a = buffers.open("job-1", "exec-a");
        let b = buffers.open("job-1", "exec-b");
        a.info("from a");
        b.info("from b");
        assert_eq!(buffers.close(&a).len(), 1);
        assert!(buffers.contains("exec-b"));
    }
}
