//! Job Event Trail
//!
//! Lifecycle events (started, completed, failed) written through tracing so
//! they land in the rolling NDJSON log alongside everything else.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use jobforge_core::{JobEvent, JobEventKind};

use crate::redact::redact_sensitive_data;

#[derive(Debug, Serialize)]
pub struct EventLogEntry {
    pub job_id: String,
    pub execution_id: String,
    pub kind: JobEventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: String,
}

impl EventLogEntry {
    pub fn from_event(event: &JobEvent) -> Self {
        Self {
            job_id: event.job_id.clone(),
            execution_id: event.execution_id.clone(),
            kind: event.kind,
            timestamp: event.timestamp,
            payload: redact_sensitive_data(&event.payload.to_string()),
        }
    }
}

pub struct EventLogger;

impl EventLogger {
    pub fn log_event(event: &JobEvent) {
        let entry = EventLogEntry::from_event(event);
        info!(
            target: "job_events",
            kind = %entry.kind,
            job_id = %entry.job_id,
            execution_id = %entry.execution_id,
            payload = %entry.payload,
            "Job event"
        );
    }

    /// Drain a bus subscription into the log until the bus is dropped.
    pub fn spawn(mut rx: broadcast::Receiver<JobEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => Self::log_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Job event logger lagged behind the bus");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
