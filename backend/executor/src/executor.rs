use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use jobforge_core::{
    ConfigMap, EngineError, ExecutionFinish, ExecutionStatus, ExecutionStore, JobEvent,
    JobEventKind, TriggerKind,
};

use crate::context::{ExecutionContext, Services};
use crate::handler::SharedHandler;
use crate::log_buffer::{render, LogBuffers};

/// One handler invocation to run.
pub struct ExecutionRequest {
    pub execution_id: String,
    pub job_id: String,
    pub dispatch_id: Option<String>,
    pub attempt: u32,
    pub trigger: TriggerKind,
    pub handler: SharedHandler,
    /// Already merged module + job config.
    pub config: ConfigMap,
    pub timeout: Duration,
    /// Parent token; the handler gets a child of it.
    pub cancel: CancellationToken,
}

/// Terminal status an execution error is recorded with.
pub fn status_for(error: &EngineError) -> ExecutionStatus {
    match error {
        EngineError::TimeoutExceeded(_) => ExecutionStatus::Timeout,
        _ => ExecutionStatus::Failed,
    }
}

/// Runs handlers under a deadline and finalises their execution records.
pub struct JobExecutor {
    services: Services,
    executions: Arc<dyn ExecutionStore>,
    buffers: Arc<LogBuffers>,
}

impl JobExecutor {
    pub fn new(services: Services, executions: Arc<dyn ExecutionStore>) -> Self {
        Self {
            services,
            executions,
            buffers: Arc::new(LogBuffers::new()),
        }
    }

    pub fn log_buffers(&self) -> &Arc<LogBuffers> {
        &self.buffers
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Run the handler, race it against `request.timeout`, then flush logs and
    /// write the terminal status. Store failures are logged, never returned.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<Value, EngineError> {
        let ExecutionRequest {
            execution_id,
            job_id,
            dispatch_id,
            attempt,
            trigger,
            handler,
            config,
            timeout,
            cancel,
        } = request;

        let logger = self.buffers.open(&job_id, &execution_id);
        let token = cancel.child_token();
        let ctx = ExecutionContext {
            execution_id: execution_id.clone(),
            job_id: job_id.clone(),
            dispatch_id,
            attempt,
            trigger,
            config,
            logger: logger.clone(),
            services: self.services.clone(),
            cancel: token.clone(),
        };

        self.publish(
            JobEventKind::Started,
            &job_id,
            &execution_id,
            serde_json::json!({ "attempt": attempt, "trigger": trigger }),
        );
        info!(job_id = %job_id, execution_id = %execution_id, attempt, "Executing job");

        let started = Instant::now();
        let mut task = tokio::spawn(async move { handler.invoke(ctx).await });

        let outcome = match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(EngineError::HandlerExecution(format!("{e:#}"))),
            Ok(Err(join_err)) => Err(EngineError::HandlerExecution(format!(
                "handler panicked: {join_err}"
            ))),
            Err(_) => {
                // The task keeps running; it only learns about the deadline via the token.
                token.cancel();
                Err(EngineError::TimeoutExceeded(timeout))
            }
        };
        let duration = started.elapsed();

        if let Err(e) = &outcome {
            logger.error(e.to_string());
        }

        // Close before any store write so the buffer is gone whatever the store does.
        let lines = self.buffers.close(&logger);

        let finish = match &outcome {
            Ok(value) => ExecutionFinish {
                status: ExecutionStatus::Completed,
                completed_at: Utc::now(),
                result: Some(value.clone()),
                error: None,
                duration_ms: duration.as_millis() as u64,
            },
            Err(e) => ExecutionFinish {
                status: status_for(e),
                completed_at: Utc::now(),
                result: None,
                error: Some(e.to_string()),
                duration_ms: duration.as_millis() as u64,
            },
        };
        self.persist(&job_id, &execution_id, &finish, &render(&lines)).await;

        match &outcome {
            Ok(_) => {
                info!(job_id = %job_id, execution_id = %execution_id, duration_ms = finish.duration_ms, "Job completed");
                self.publish(
                    JobEventKind::Completed,
                    &job_id,
                    &execution_id,
                    serde_json::json!({ "durationMs": finish.duration_ms }),
                );
            }
            Err(e) => {
                warn!(job_id = %job_id, execution_id = %execution_id, status = %finish.status, error = %e, "Job failed");
                self.publish(
                    JobEventKind::Failed,
                    &job_id,
                    &execution_id,
                    serde_json::json!({
                        "status": finish.status,
                        "error": e.to_string(),
                        "durationMs": finish.duration_ms,
                    }),
                );
            }
        }

        outcome
    }

    async fn persist(&self, job_id: &str, execution_id: &str, finish: &ExecutionFinish, logs: &str) {
        match self.executions.finish_execution(execution_id, finish).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(job_id = %job_id, execution_id = %execution_id, "Execution was already finalised");
            }
            Err(e) => {
                error!(job_id = %job_id, execution_id = %execution_id, error = %e, "Failed to persist execution status");
            }
        }
        if let Err(e) = self.executions.append_logs(execution_id, logs).await {
            error!(job_id = %job_id, execution_id = %execution_id, error = %e, "Failed to persist execution logs");
        }
    }

    fn publish(&self, kind: JobEventKind, job_id: &str, execution_id: &str, payload: Value) {
        self.services
            .events
            .publish(JobEvent::new(kind, job_id, execution_id, payload));
    }
}
