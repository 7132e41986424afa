//! Fire-and-forget batch execution.
//!
//! A batch fans out independent ad-hoc tasks: the caller gets the
//! batch id immediately, tasks run under a bounded semaphore, and an
//! optional callback URL is POSTed the final state. Completed batches
//! live in a bounded table with the oldest evicted past the cap.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{Batch, BatchTask, RunStatus, StepStatus, TaskStatus};

use super::orchestrator::Orchestrator;
use super::registry::{RetryPolicy, Step};

/// One task submitted to a batch: a single agent call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchTaskSpec {
    pub agent: String,

    pub action: String,

    #[serde(default)]
    pub params: Value,

    /// Retries after the first failed attempt
    #[serde(default)]
    pub max_retries: u32,
}

#[derive(Default)]
struct BatchTable {
    batches: HashMap<Uuid, Batch>,
}

impl BatchTable {
    /// Drop the oldest completed batches beyond the cap.
    fn evict_completed(&mut self, cap: usize) {
        let mut completed: Vec<(Uuid, chrono::DateTime<Utc>)> = self
            .batches
            .iter()
            .filter(|(_, b)| b.is_complete())
            .map(|(id, b)| (*id, b.completed_at.unwrap_or(b.started_at)))
            .collect();
        if completed.len() <= cap {
            return;
        }
        completed.sort_by_key(|(_, t)| *t);
        let excess = completed.len().saturating_sub(cap);
        for (id, _) in completed.into_iter().take(excess) {
            self.batches.remove(&id);
        }
    }
}

/// Drives batch fan-out on top of the orchestrator.
#[derive(Clone)]
pub struct BatchRunner {
    orchestrator: Orchestrator,
    batches: Arc<Mutex<BatchTable>>,
    // Separate from the engine's call semaphore: a batch permit is
    // held across a whole task, a call permit only across one call
    task_permits: Arc<Semaphore>,
    retention: usize,
}

impl BatchRunner {
    pub fn new(orchestrator: Orchestrator) -> Self {
        let limits = orchestrator.limits().clone();
        Self {
            orchestrator,
            batches: Arc::new(Mutex::new(BatchTable::default())),
            task_permits: Arc::new(Semaphore::new(limits.max_parallel_calls)),
            retention: limits.batch_retention,
        }
    }

    /// Submit a batch. Returns the batch id immediately; progress is
    /// available through [`BatchRunner::get_batch`].
    pub fn execute_batch(&self, tasks: Vec<BatchTaskSpec>, callback_url: Option<String>) -> Uuid {
        let placeholders: Vec<BatchTask> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| BatchTask::queued(i, &t.agent, &t.action))
            .collect();
        let batch = Batch::new(placeholders, callback_url);
        let batch_id = batch.id;

        {
            let mut table = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
            table.batches.insert(batch_id, batch);
        }

        info!(%batch_id, tasks = tasks.len(), "Batch submitted");

        let this = self.clone();
        tokio::spawn(async move {
            this.drive(batch_id, tasks).await;
        });

        batch_id
    }

    async fn drive(&self, batch_id: Uuid, tasks: Vec<BatchTaskSpec>) {
        let mut handles = Vec::with_capacity(tasks.len());

        for (index, task) in tasks.into_iter().enumerate() {
            let this = self.clone();
            handles.push(tokio::spawn(async move {
                let _permit = this.task_permits.clone().acquire_owned().await.ok();
                this.set_task(batch_id, index, TaskStatus::Running, None, None);

                let step = Step {
                    id: format!("task-{}", index),
                    agent: task.agent,
                    action: task.action,
                    params: task.params,
                    max_retries: task.max_retries,
                    timeout_seconds: None,
                    retry_policy: RetryPolicy::default(),
                };

                match this.orchestrator.execute_ad_hoc(vec![step], Value::Null).await {
                    Ok(run) if run.status == RunStatus::Completed => {
                        this.set_task(batch_id, index, TaskStatus::Succeeded, Some(run.id), None);
                    }
                    Ok(run) => {
                        let error = run
                            .steps
                            .iter()
                            .find(|s| s.status == StepStatus::Failed)
                            .and_then(|s| s.error.clone());
                        this.set_task(batch_id, index, TaskStatus::Failed, Some(run.id), error);
                    }
                    Err(e) => {
                        this.set_task(batch_id, index, TaskStatus::Failed, None, Some(e.to_string()));
                    }
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        let finished = {
            let mut table = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
            let snapshot = table.batches.get_mut(&batch_id).map(|batch| {
                batch.completed_at = Some(Utc::now());
                batch.clone()
            });
            table.evict_completed(self.retention);
            snapshot
        };

        if let Some(batch) = finished {
            info!(%batch_id, progress = batch.progress_percent(), "Batch finished");
            if let Some(ref url) = batch.callback_url {
                post_callback(url, &batch).await;
            }
        }
    }

    pub fn get_batch(&self, batch_id: Uuid) -> Option<Batch> {
        let table = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
        table.batches.get(&batch_id).cloned()
    }

    pub fn list_batches(&self) -> Vec<Batch> {
        let table = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
        let mut batches: Vec<Batch> = table.batches.values().cloned().collect();
        batches.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        batches
    }

    fn set_task(
        &self,
        batch_id: Uuid,
        index: usize,
        status: TaskStatus,
        run_id: Option<Uuid>,
        error: Option<String>,
    ) {
        let mut table = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(batch) = table.batches.get_mut(&batch_id) {
            if let Some(task) = batch.tasks.get_mut(index) {
                task.status = status;
                if run_id.is_some() {
                    task.run_id = run_id;
                }
                if error.is_some() {
                    task.error = error;
                }
            }
        }
    }
}

/// Completion callback is best-effort: failures are logged, never
/// surfaced to the batch.
async fn post_callback(url: &str, batch: &Batch) {
    let client = reqwest::Client::new();
    match client.post(url).json(batch).send().await {
        Ok(response) if response.status().is_success() => {}
        Ok(response) => {
            warn!(status = %response.status(), "Batch callback rejected");
        }
        Err(e) => {
            warn!(error = %e, "Batch callback unreachable");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_batch_eviction() {
        let mut table = BatchTable::default();
        for i in 0..4 {
            let mut batch = Batch::new(Vec::new(), None);
            batch.completed_at = Some(Utc::now() + chrono::Duration::seconds(i));
            table.batches.insert(batch.id, batch);
        }

        table.evict_completed(2);
        assert_eq!(table.batches.len(), 2);
    }

    #[test]
    fn test_incomplete_batches_never_evicted() {
        let mut table = BatchTable::default();
        for _ in 0..3 {
            let batch = Batch::new(vec![BatchTask::queued(0, "a", "act")], None);
            table.batches.insert(batch.id, batch);
        }

        table.evict_completed(1);
        assert_eq!(table.batches.len(), 3);
    }
}
