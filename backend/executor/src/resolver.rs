//! Turning a validated handler path into invocable code.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use jobforge_core::HandlerLoadError;

use crate::context::ExecutionContext;
use crate::log_buffer::JobLogger;
use crate::handler::{Handler, SharedHandler};

/// A handler path that already passed traversal validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerLocation {
    pub module_id: String,
    pub module_root: PathBuf,
    /// As written on the job.
    pub relative: String,
    /// Validated absolute path under `module_root`.
    pub path: PathBuf,
}

#[async_trait]
pub trait HandlerResolver: Send + Sync {
    async fn resolve(&self, location: &HandlerLocation) -> Result<SharedHandler, HandlerLoadError>;
}

// ---------------------------------------------------------------------------
// In-process registry
// ---------------------------------------------------------------------------

/// Handlers registered in code, looked up by their relative path.
#[derive(Default)]
pub struct RegistryResolver {
    handlers: RwLock<HashMap<String, SharedHandler>>,
}

impl RegistryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, relative: impl Into<String>, handler: SharedHandler) {
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        handlers.insert(relative.into(), handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl HandlerResolver for RegistryResolver {
    async fn resolve(&self, location: &HandlerLocation) -> Result<SharedHandler, HandlerLoadError> {
        let handlers = self.handlers.read().unwrap_or_else(|p| p.into_inner());
        let key = location.relative.trim_start_matches("./");
        handlers
            .get(key)
            .cloned()
            .ok_or_else(|| HandlerLoadError::NotFound(location.path.clone()))
    }
}

// ---------------------------------------------------------------------------
// Subprocess handlers
// ---------------------------------------------------------------------------

const STDERR_TAIL_LINES: usize = 20;

/// Runs handler files as child processes.
pub struct ProcessResolver {
    max_output_bytes: usize,
}

impl ProcessResolver {
    pub fn new(max_output_bytes: usize) -> Self {
        Self { max_output_bytes }
    }
}

impl Default for ProcessResolver {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

fn interpreter_for(path: &Path) -> Option<&'static str> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("sh") => Some("sh"),
        Some("py") => Some("python3"),
        Some("js") | Some("mjs") => Some("node"),
        Some("rb") => Some("ruby"),
        _ => None,
    }
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}

#[async_trait]
impl HandlerResolver for ProcessResolver {
    async fn resolve(&self, location: &HandlerLocation) -> Result<SharedHandler, HandlerLoadError> {
        let path = &location.path;
        let invalid = |reason: &str| HandlerLoadError::Invalid {
            path: path.clone(),
            reason: reason.to_string(),
        };

        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(HandlerLoadError::NotFound(path.clone()))
            }
            Err(e) => return Err(invalid(&e.to_string())),
        };
        if metadata.is_dir() {
            return Err(invalid("handler is a directory"));
        }
        if metadata.len() == 0 {
            return Err(invalid("handler file is empty"));
        }

        let interpreter = interpreter_for(path);
        if interpreter.is_none() && !is_executable(&metadata) {
            return Err(invalid("handler is neither executable nor a known script type"));
        }

        debug!(path = %path.display(), interpreter = ?interpreter, "Resolved process handler");
        Ok(Arc::new(ProcessHandler {
            path: path.clone(),
            working_dir: location.module_root.clone(),
            interpreter,
            max_output_bytes: self.max_output_bytes,
        }))
    }
}

pub struct ProcessHandler {
    path: PathBuf,
    working_dir: PathBuf,
    interpreter: Option<&'static str>,
    max_output_bytes: usize,
}

/// Read at most `max` bytes, then drain the rest so the child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, max: usize) -> std::io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::new();
    (&mut reader).take(max as u64).read_to_end(&mut buf).await?;
    let extra = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    Ok((buf, extra > 0))
}

/// Forward stderr lines to the job log until `max` bytes have gone through, then drain.
/// Returns the last few lines and whether anything was dropped.
async fn forward_stderr<R: AsyncRead + Unpin>(
    stderr: R,
    logger: JobLogger,
    max: usize,
) -> (Vec<String>, bool) {
    let mut reader = BufReader::new(stderr);
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut forwarded = 0usize;
    let mut buf = Vec::new();

    while forwarded < max {
        buf.clear();
        // The remaining budget also bounds a single unterminated line.
        let budget = (max - forwarded) as u64;
        match (&mut reader).take(budget).read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => return (tail.into(), false),
            Ok(n) => forwarded += n,
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']).to_string();
        logger.info(&line);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    let dropped = tokio::io::copy(&mut reader, &mut tokio::io::sink())
        .await
        .unwrap_or(0);
    (tail.into(), dropped > 0)
}

fn parse_output(stdout: &[u8]) -> Value {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

#[async_trait]
impl Handler for ProcessHandler {
    async fn invoke(&self, ctx: ExecutionContext) -> Result<Value> {
        let mut cmd = match self.interpreter {
            Some(interpreter) => {
                let mut c = Command::new(interpreter);
                c.arg(&self.path);
                c
            }
            None => Command::new(&self.path),
        };
        cmd.current_dir(&self.working_dir)
            .env("JOBFORGE_JOB_ID", &ctx.job_id)
            .env("JOBFORGE_EXECUTION_ID", &ctx.execution_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn handler {}", self.path.display()))?;

        let input = serde_json::to_vec(&ctx.to_json())?;
        let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("handler stdin unavailable"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("handler stdout unavailable"))?;
        let stderr = child.stderr.take().ok_or_else(|| anyhow!("handler stderr unavailable"))?;

        // A handler that ignores stdin may exit before we finish writing.
        if let Err(e) = stdin.write_all(&input).await {
            debug!(error = %e, "Handler closed stdin early");
        }
        drop(stdin);

        let max = self.max_output_bytes;
        let stdout_task = tokio::spawn(read_capped(stdout, max));

        let stderr_task = tokio::spawn(forward_stderr(stderr, ctx.logger.clone(), max));

        let status = tokio::select! {
            status = child.wait() => status.context("Failed to wait for handler")?,
            _ = ctx.cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, path = %self.path.display(), "Failed to kill cancelled handler");
                }
                bail!("handler cancelled");
            }
        };

        let (out, truncated) = stdout_task.await??;
        let (tail, stderr_truncated) = stderr_task.await.unwrap_or_default();
        if truncated {
            ctx.logger
                .warn(format!("handler output truncated to {max} bytes"));
        }
        if stderr_truncated {
            ctx.logger.warn(format!("handler stderr truncated to {max} bytes"));
        }

        if !status.success() {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            if tail.is_empty() {
                bail!("handler exited with status {code}");
            }
            bail!("handler exited with status {code}: {}", tail.join("\n"));
        }

        Ok(parse_output(&out))
    }
}
