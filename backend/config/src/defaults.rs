//! Config defaults, and the post-parse pass that resolves relative paths.

use std::path::{Path, PathBuf};

use crate::schema::JobForgeConfig;

pub const DEFAULT_DATABASE_PATH: &str = "jobforge.db";
pub const DEFAULT_HANDLER_DATABASE_PATH: &str = "jobforge-handlers.db";
pub const DEFAULT_CONCURRENCY: usize = 5;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_FINISHED_RETENTION_HOURS: u64 = 168;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 2_000;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_MAX_DELAY_MS: u64 = 300_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MODULES_DIR: &str = "modules";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_LOG_DIR: &str = "logs";
pub const DEFAULT_ADMIN_BIND: &str = "127.0.0.1";
pub const DEFAULT_ADMIN_PORT: u16 = 8090;

/// In-memory SQLite marker; never treated as a path.
pub const MEMORY_DATABASE: &str = ":memory:";

/// Apply all defaults to a freshly loaded config.
///
/// Relative paths are anchored at `base_dir` (the directory holding the config
/// file) so the engine behaves the same whatever the working directory is.
pub fn apply_all_defaults(config: JobForgeConfig, base_dir: &Path) -> JobForgeConfig {
    let config = apply_logging_defaults(config);
    apply_path_defaults(config, base_dir)
}

fn apply_logging_defaults(mut config: JobForgeConfig) -> JobForgeConfig {
    let level = config.logging.level.trim().to_ascii_lowercase();
    config.logging.level = if level.is_empty() {
        DEFAULT_LOG_LEVEL.to_string()
    } else {
        level
    };
    config
}

fn apply_path_defaults(mut config: JobForgeConfig, base_dir: &Path) -> JobForgeConfig {
    if config.database.path.as_os_str() != MEMORY_DATABASE {
        config.database.path = anchor(&config.database.path, base_dir);
    }
    if config.database.handler_path.as_os_str() != MEMORY_DATABASE {
        config.database.handler_path = anchor(&config.database.handler_path, base_dir);
    }
    if config.modules.root_dir.as_os_str().is_empty() {
        config.modules.root_dir = PathBuf::from(DEFAULT_MODULES_DIR);
    }
    config.modules.root_dir = anchor(&config.modules.root_dir, base_dir);
    if config.logging.dir.as_os_str().is_empty() {
        config.logging.dir = PathBuf::from(DEFAULT_LOG_DIR);
    }
    config.logging.dir = anchor(&config.logging.dir, base_dir);
    config
}

fn anchor(path: &Path, base_dir: &Path) -> PathBuf {
    if path.as_os_str().is_empty() || path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}
