//! Fire-and-forget batch fan-out state.
//!
//! A batch groups independent ad-hoc tasks. The caller gets the batch
//! id immediately and polls for progress; completed batches are kept in
//! a bounded table with the oldest evicted past the cap.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A batch of independent ad-hoc tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,

    /// Per-task state, in submission order
    pub tasks: Vec<BatchTask>,

    pub started_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,

    /// URL POSTed with the final batch state, fire-and-forget
    pub callback_url: Option<String>,
}

impl Batch {
    pub fn new(tasks: Vec<BatchTask>, callback_url: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tasks,
            started_at: Utc::now(),
            completed_at: None,
            callback_url,
        }
    }

    /// Share of tasks in a terminal state, 0-100.
    pub fn progress_percent(&self) -> u8 {
        if self.tasks.is_empty() {
            return 100;
        }
        let done = self.tasks.iter().filter(|t| t.is_terminal()).count();
        ((done * 100) / self.tasks.len()) as u8
    }

    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(BatchTask::is_terminal)
    }
}

/// One task inside a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchTask {
    /// Position in the submission order
    pub index: usize,

    pub agent: String,

    pub action: String,

    pub status: TaskStatus,

    /// ChainRun backing this task once it dispatched
    pub run_id: Option<Uuid>,

    pub error: Option<String>,
}

impl BatchTask {
    pub fn queued(index: usize, agent: &str, action: &str) -> Self {
        Self {
            index,
            agent: agent.to_string(),
            action: action.to_string(),
            status: TaskStatus::Queued,
            run_id: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

/// Status of a batch task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a concurrency permit
    Queued,

    /// Dispatched and in flight
    Running,

    Succeeded,

    Failed,
}
