//! `jobforge-config`: engine configuration.
//!
//! Provides:
//! - Typed config schema (queue, retry, executor, modules, logging, admin)
//! - YAML loading with a defaults-only first run
//! - `${ENV_VAR}` substitution
//! - Default value application and path anchoring
//! - Semantic validation

pub mod defaults;
pub mod env;
pub mod io;
pub mod schema;
pub mod validation;

// Re-export most-used types at crate root.
pub use defaults::apply_all_defaults;
pub use env::{resolve_env_vars, resolve_env_vars_with, MissingEnvVarError};
pub use io::{config_dir, config_file_path, load_config_value, parse_yaml, resolve_config_path};
pub use schema::{
    AdminConfig, DatabaseConfig, ExecutorConfig, JobForgeConfig, LoggingConfig, ModulesConfig,
    QueueConfig, RetryConfig,
};
pub use validation::{validate, ConfigValidationError, ValidationReport};

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

/// Load, apply env substitution, apply defaults, and validate a config file.
///
/// This is the main entry point for loading a config at runtime.
pub async fn load_and_prepare(path: &Path) -> Result<JobForgeConfig> {
    let value = load_config_value(path).await?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let env: HashMap<String, String> = std::env::vars().collect();
    prepare_value(value, base_dir, &env)
        .with_context(|| format!("Invalid config: {}", path.display()))
}

/// Turn an untyped config tree into a validated config.
///
/// Warnings are logged; any error fails the whole load.
pub fn prepare_value(
    value: Value,
    base_dir: &Path,
    env: &HashMap<String, String>,
) -> Result<JobForgeConfig> {
    let value = resolve_env_vars_with(&value, env).context("Failed to resolve env vars in config")?;

    let config: JobForgeConfig =
        serde_json::from_value(value).context("Failed to deserialize config")?;

    let config = apply_all_defaults(config, base_dir);

    let report = validate(&config);
    for warning in &report.warnings {
        tracing::warn!(path = %warning.path, message = %warning.message, "Config warning");
    }
    if !report.is_valid() {
        for error in &report.errors {
            tracing::error!(path = %error.path, message = %error.message, "Config error");
        }
        anyhow::bail!("{}", report.error_summary());
    }

    Ok(config)
}
