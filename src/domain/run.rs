//! Chain run state and per-step results.
//!
//! A ChainRun is one execution of a named chain or an ad-hoc step list.
//! It is owned exclusively by the orchestrator instance that created it;
//! external pollers see eventually-consistent snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name recorded for runs that were not started from a named chain.
pub const AD_HOC_CHAIN: &str = "ad-hoc";

/// One execution of a chain or ad-hoc step list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainRun {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Chain name, or `"ad-hoc"`
    pub chain_name: String,

    /// Current state of the run
    pub status: RunStatus,

    /// Results in definition order
    pub steps: Vec<StepResult>,

    /// Input the run was started with
    pub input: serde_json::Value,

    pub started_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Sum of every attempt's reported cost, including failed and
    /// discarded attempts (cost reflects what was spent)
    pub total_cost: f64,

    /// Correlation key stamped on every bus event for this run
    pub correlation_id: Uuid,
}

impl ChainRun {
    /// Create a run with pending placeholders for every step.
    pub fn new(chain_name: &str, input: serde_json::Value, steps: Vec<StepResult>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            chain_name: chain_name.to_string(),
            status: RunStatus::Pending,
            steps,
            input,
            started_at: Utc::now(),
            completed_at: None,
            total_cost: 0.0,
            correlation_id: id,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut StepResult> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    /// Whether the run has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, RunStatus::Pending | RunStatus::Running)
    }

    /// Settle the final status from per-step outcomes: completed when
    /// every step succeeded, partial when independent steps still
    /// succeeded alongside failures, failed otherwise. A run with no
    /// successes at all is failed, never partial.
    pub fn finish(&mut self, aborted: bool) {
        self.completed_at = Some(Utc::now());
        let any_failed = self
            .steps
            .iter()
            .any(|s| matches!(s.status, StepStatus::Failed | StepStatus::Cancelled));
        let any_succeeded = self.steps.iter().any(|s| s.status == StepStatus::Succeeded);
        self.status = if aborted || (any_failed && !any_succeeded) {
            RunStatus::Failed
        } else if any_failed {
            RunStatus::Partial
        } else {
            RunStatus::Completed
        };
    }
}

/// State of a chain run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet dispatching
    Pending,

    /// Currently executing
    Running,

    /// Every step succeeded
    Completed,

    /// A step failed and a dependent stage could not proceed,
    /// or the chain deadline expired
    Failed,

    /// Some steps failed but independent later stages still ran
    Partial,

    /// Cancelled by id; pending steps were never dispatched
    Cancelled,
}

/// Result of a single step within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Step id, unique within the chain
    pub step_id: String,

    /// Target agent
    pub agent: String,

    /// Target action on the agent
    pub action: String,

    pub status: StepStatus,

    /// Attempts made so far (a step with `max_retries = 2` makes at
    /// most 3 attempts)
    pub attempts: u32,

    /// Payload returned by the agent on success
    pub output: Option<serde_json::Value>,

    /// Failure detail, per attempt exhaustion or cancellation
    pub error: Option<String>,

    /// Cost contributed by every attempt of this step
    pub cost: f64,

    pub started_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,
}

impl StepResult {
    /// Pending placeholder created during validation.
    pub fn pending(step_id: &str, agent: &str, action: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            agent: agent.to_string(),
            action: action.to_string(),
            status: StepStatus::Pending,
            attempts: 0,
            output: None,
            error: None,
            cost: 0.0,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = StepStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_succeeded(&mut self, output: serde_json::Value) {
        self.status = StepStatus::Succeeded;
        self.output = Some(output);
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = StepStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = StepStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }
}

/// Status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet dispatched
    Pending,

    /// Call in flight
    Running,

    /// Between failed attempts
    Retrying,

    /// Completed successfully
    Succeeded,

    /// Attempts exhausted, deadline expired, or dependency failed
    Failed,

    /// Never dispatched because the run was cancelled
    Cancelled,
}
