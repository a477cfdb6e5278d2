//! Config validation: semantic checks with user-friendly error messages.

use crate::defaults::MEMORY_DATABASE;
use crate::schema::JobForgeConfig;
use thiserror::Error;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// A config validation error with field path and message.
#[derive(Debug, Error)]
#[error("Config validation error at '{path}': {message}")]
pub struct ConfigValidationError {
    pub path: String,
    pub message: String,
}

/// A collection of validation errors found in one pass.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// All errors on one line each, for surfacing to an operator.
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }
}

/// Validate the config and return a report of all errors and warnings.
pub fn validate(config: &JobForgeConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    validate_database(config, &mut report);
    validate_queue(config, &mut report);
    validate_retry(config, &mut report);
    validate_executor(config, &mut report);
    validate_logging(config, &mut report);
    validate_admin(config, &mut report);
    report
}

fn validate_database(config: &JobForgeConfig, report: &mut ValidationReport) {
    let db = &config.database;
    if db.path.as_os_str().is_empty() {
        report.error("database.path", "Database path cannot be empty");
    }
    if db.handler_path.as_os_str().is_empty() {
        report.error("database.handlerPath", "Handler database path cannot be empty");
    } else if db.handler_path == db.path && db.path.as_os_str() != MEMORY_DATABASE {
        report.error(
            "database.handlerPath",
            "Handler database must not be the engine database",
        );
    }
}

fn validate_queue(config: &JobForgeConfig, report: &mut ValidationReport) {
    let queue = &config.queue;
    if queue.concurrency == 0 {
        report.error("queue.concurrency", "concurrency must be >= 1");
    } else if queue.concurrency > 256 {
        report.warn(
            "queue.concurrency",
            format!("{} workers is unusually high for one SQLite-backed engine", queue.concurrency),
        );
    }
    if queue.poll_interval_ms == 0 {
        report.error("queue.pollIntervalMs", "pollIntervalMs must be > 0");
    }
    if queue.tick_interval_ms == 0 {
        report.error("queue.tickIntervalMs", "tickIntervalMs must be > 0");
    } else if queue.tick_interval_ms > 60_000 {
        report.warn(
            "queue.tickIntervalMs",
            "Ticks longer than a minute delay every-minute schedules",
        );
    }
}

fn validate_retry(config: &JobForgeConfig, report: &mut ValidationReport) {
    let retry = &config.retry;
    if retry.max_attempts == 0 {
        report.error("retry.maxAttempts", "maxAttempts must be >= 1");
    }
    if !(retry.multiplier >= 1.0) {
        report.error("retry.multiplier", "multiplier must be >= 1.0");
    }
    if retry.max_delay_ms < retry.base_delay_ms {
        report.warn(
            "retry.maxDelayMs",
            "maxDelayMs is below baseDelayMs; every retry waits maxDelayMs",
        );
    }
}

fn validate_executor(config: &JobForgeConfig, report: &mut ValidationReport) {
    if config.executor.default_timeout_ms == 0 {
        report.error("executor.defaultTimeoutMs", "defaultTimeoutMs must be > 0");
    }
    if config.executor.max_output_bytes == 0 {
        report.warn("executor.maxOutputBytes", "Handler output will always be discarded");
    }
}

fn validate_logging(config: &JobForgeConfig, report: &mut ValidationReport) {
    if !LOG_LEVELS.contains(&config.logging.level.as_str()) {
        report.error(
            "logging.level",
            format!(
                "Unknown log level '{}'. Use one of: {}",
                config.logging.level,
                LOG_LEVELS.join(", ")
            ),
        );
    }
}

fn validate_admin(config: &JobForgeConfig, report: &mut ValidationReport) {
    let port = config.admin.port;
    if port == 0 {
        report.error("admin.port", "port must be > 0");
    } else if port < 1024 {
        report.warn(
            "admin.port",
            format!("Port {port} requires elevated privileges; consider using a port >= 1024"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn default_config_is_valid() {
        let report = validate(&JobForgeConfig::default());
        assert!(report.is_valid(), "errors: {:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn rejects_each_invalid_setting() {
        let mut cfg = JobForgeConfig::default();
        cfg.queue.concurrency = 0;
        cfg.retry.multiplier = 0.5;
        cfg.retry.max_attempts = 0;
        cfg.executor.default_timeout_ms = 0;
        cfg.database.path = PathBuf::new();

        let report = validate(&cfg);
        let paths: Vec<&str> = report.errors.iter().map(|e| e.path.as_str()).collect();
        for expected in [
            "queue.concurrency",
            "retry.multiplier",
            "retry.maxAttempts",
            "executor.defaultTimeoutMs",
            "database.path",
        ] {
            assert!(paths.contains(&expected), "missing {expected} in {paths:?}");
        }
    }

    #[test]
    fn handler_database_must_be_separate() {
        let mut cfg = JobForgeConfig::default();
        cfg.database.handler_path = cfg.database.path.clone();
        let report = validate(&cfg);
        assert!(report.errors.iter().any(|e| e.path == "database.handlerPath"));

        cfg.database.path = PathBuf::from(":memory:");
        cfg.database.handler_path = PathBuf::from(":memory:");
        assert!(validate(&cfg).errors.is_empty());
    }

    #[test]
    fn nan_multiplier_is_rejected() {
        let mut cfg = JobForgeConfig::default();
        cfg.retry.multiplier = f64::NAN;
        assert!(!validate(&cfg).is_valid());
    }

    #[test]
    fn privileged_port_is_only_a_warning() {
        let mut cfg = JobForgeConfig::default();
        cfg.admin.port = 80;
        let report = validate(&cfg);
        assert!(report.is_valid());
        assert_eq!(report.warnings[0].path, "admin.port");
    }

    #[test]
    fn unknown_log_level_is_error() {
        let mut cfg = JobForgeConfig::default();
        cfg.logging.level = "loud".into();
        assert!(!validate(&cfg).is_valid());
    }
}
