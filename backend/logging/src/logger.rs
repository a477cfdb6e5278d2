//! Structured Logger
//!
//! Wraps `tracing` to provide console output (plain or JSON), a daily rolling
//! NDJSON file, and environment-based level control.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Prefix of the rolling log files: `jobforge.log.YYYY-MM-DD`.
pub const LOG_FILE_PREFIX: &str = "jobforge.log";

/// Initialize the global structured logger.
///
/// `RUST_LOG` wins over `level` when set. A second call is a no-op, which keeps
/// tests that initialise logging independently from fighting over the global
/// subscriber.
pub fn init_logger<P: AsRef<Path>>(log_dir: P, level: &str, json: bool) -> Result<()> {
    let log_dir = log_dir.as_ref();
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_PREFIX);
    let file_layer = fmt::layer()
        .json()
        .with_writer(file_appender)
        .with_ansi(false);

    let json_console = json.then(|| fmt::layer().json().with_writer(std::io::stdout));
    let plain_console = (!json).then(|| {
        fmt::layer()
            .with_writer(std::io::stdout)
            .with_target(false)
            .with_ansi(true)
    });

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(json_console)
        .with(plain_console)
        .with(file_layer)
        .try_init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_missing_log_directory() {
        let dir = std::env::temp_dir().join(format!("jobforge-logs-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        init_logger(&dir, "warn", true).unwrap();
        assert!(dir.is_dir());
        // Re-initialising must not error.
        init_logger(&dir, "debug", false).unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
