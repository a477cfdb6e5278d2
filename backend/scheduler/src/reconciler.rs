//! Removes recurring queue entries whose job no longer exists.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use jobforge_core::{EngineError, JobStore, QueueStore};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub removed_count: usize,
    pub removed_job_ids: Vec<String>,
}

pub struct OrphanReconciler {
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn QueueStore>,
}

impl OrphanReconciler {
    pub fn new(jobs: Arc<dyn JobStore>, queue: Arc<dyn QueueStore>) -> Self {
        Self { jobs, queue }
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport, EngineError> {
        let recurring = self.queue.list_recurring().await?;
        let known: HashSet<String> = self.jobs.list_job_ids().await?.into_iter().collect();

        let mut report = ReconcileReport::default();
        for entry in recurring.into_iter().filter(|e| !known.contains(&e.job_id)) {
            // Another caller may have removed it in between; only count our removals.
            if self.queue.remove_recurring(&entry.job_id).await? {
                warn!(job_id = %entry.job_id, cron = %entry.cron, "Removed orphaned recurring entry");
                report.removed_count += 1;
                report.removed_job_ids.push(entry.job_id);
            }
        }
        info!(removed = report.removed_count, "Orphan reconciliation finished");
        Ok(report)
    }
}
