//! Config file location and loading.

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Default config file name within the config directory.
const CONFIG_FILE_NAME: &str = "jobforge.yaml";

/// Resolve the JobForge config directory.
/// Priority: `JOBFORGE_CONFIG_DIR` env > `~/.jobforge/` > `./.jobforge`
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("JOBFORGE_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    match dirs::home_dir() {
        Some(home) => home.join(".jobforge"),
        None => PathBuf::from(".jobforge"),
    }
}

/// Resolve the full path to the main config file.
pub fn config_file_path(config_dir: &Path) -> PathBuf {
    config_dir.join(CONFIG_FILE_NAME)
}

/// Pick the config file: explicit flag, then `JOBFORGE_CONFIG`, then the config dir.
pub fn resolve_config_path(cli: Option<&Path>) -> PathBuf {
    if let Some(path) = cli {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var("JOBFORGE_CONFIG") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    config_file_path(&config_dir())
}

/// Read the YAML file into an untyped tree.
///
/// Returns an empty object if the file doesn't exist (first run), so every
/// section falls back to its defaults.
pub async fn load_config_value(path: &Path) -> Result<Value> {
    if !path.exists() {
        debug!(path = %path.display(), "Config file does not exist; using defaults");
        return Ok(Value::Object(Default::default()));
    }

    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let value = parse_yaml(&raw)
        .with_context(|| format!("Failed to parse config YAML at: {}", path.display()))?;

    info!(path = %path.display(), "Loaded config");
    Ok(value)
}

/// Parse YAML text into a JSON tree. An empty document is an empty object.
pub fn parse_yaml(raw: &str) -> Result<Value> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    let value: Value = serde_yaml::from_str(raw)?;
    match value {
        Value::Null => Ok(Value::Object(Default::default())),
        Value::Object(_) => Ok(value),
        other => anyhow::bail!("config root must be a mapping, got {other}"),
    }
}
