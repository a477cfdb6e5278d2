//! JobForge engine configuration schema.
//!
//! Every section and field is optional in the YAML file; missing values take
//! the defaults from [`crate::defaults`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::defaults::*;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobForgeConfig {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub retry: RetryConfig,
    pub executor: ExecutorConfig,
    pub modules: ModulesConfig,
    pub logging: LoggingConfig,
    pub admin: AdminConfig,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// SQLite file, or `:memory:`.
    pub path: PathBuf,
    /// Separate SQLite file handed to handlers through `Database`.
    pub handler_path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_DATABASE_PATH),
            handler_path: PathBuf::from(DEFAULT_HANDLER_DATABASE_PATH),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueConfig {
    /// Number of workers.
    pub concurrency: usize,
    /// How often an idle worker re-checks the queue.
    pub poll_interval_ms: u64,
    /// How often due recurring entries are dispatched.
    pub tick_interval_ms: u64,
    pub default_priority: i32,
    pub finished_retention_hours: u64,
    /// Defer a dispatch while the same job already runs in this engine.
    pub exclusive_jobs: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            default_priority: 0,
            finished_retention_hours: DEFAULT_FINISHED_RETENTION_HOURS,
            exclusive_jobs: false,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn finished_retention(&self) -> Duration {
        Duration::from_secs(self.finished_retention_hours * 3600)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Total attempts for jobs that do not set their own retry count.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutorConfig {
    /// Applied to jobs registered without an explicit timeout.
    pub default_timeout_ms: u64,
    /// Cap on captured stdout of process handlers.
    pub max_output_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl ExecutorConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModulesConfig {
    /// Parent directory of installed modules.
    pub root_dir: PathBuf,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(DEFAULT_MODULES_DIR),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingConfig {
    pub level: String,
    pub dir: PathBuf,
    /// JSON console output; the file output is always JSON.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            dir: PathBuf::from(DEFAULT_LOG_DIR),
            json: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdminConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_ADMIN_BIND.to_string(),
            port: DEFAULT_ADMIN_PORT,
        }
    }
}

impl AdminConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
