//! Chain execution engine.
//!
//! Runs named chains or ad-hoc step lists: resolves parameter
//! templates, executes stages in order (steps within a parallel stage
//! run concurrently under a bounded semaphore), retries failed calls,
//! enforces step and chain deadlines, and aggregates cost. Every
//! transition is mirrored onto the Event Bus with the run id as
//! correlation key; a bus write failure never fails the run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{AgentClient, Notification, Notifier, Priority};
use crate::domain::run::AD_HOC_CHAIN;
use crate::domain::{ChainRun, RunStatus, StepResult, StepStatus};
use crate::error::CallError;

use super::bus::EventBus;
use super::registry::{Registry, Stage, Step};
use super::template::{self, TemplateContext};

/// Failure reason recorded on steps abandoned by a chain deadline.
pub const CHAIN_TIMEOUT: &str = "chain_timeout";

/// Engine-wide execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Cap on simultaneous outbound calls across parallel stages
    /// and batch fan-out
    #[serde(default = "default_max_parallel_calls")]
    pub max_parallel_calls: usize,

    /// Chain deadline when the chain does not declare one
    #[serde(default = "default_chain_timeout")]
    pub chain_timeout_seconds: u64,

    /// Terminal runs kept before the oldest are evicted
    #[serde(default = "default_run_retention")]
    pub run_retention: usize,

    /// Completed batches kept before the oldest are evicted
    #[serde(default = "default_batch_retention")]
    pub batch_retention: usize,
}

fn default_max_parallel_calls() -> usize {
    8
}
fn default_chain_timeout() -> u64 {
    3600
}
fn default_run_retention() -> usize {
    256
}
fn default_batch_retention() -> usize {
    64
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_parallel_calls: default_max_parallel_calls(),
            chain_timeout_seconds: default_chain_timeout(),
            run_retention: default_run_retention(),
            batch_retention: default_batch_retention(),
        }
    }
}

struct RunEntry {
    run: ChainRun,
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
struct RunTable {
    runs: HashMap<Uuid, RunEntry>,
}

impl RunTable {
    /// Drop the oldest terminal runs beyond the cap. Live runs are
    /// never evicted.
    fn evict_terminal(&mut self, cap: usize) {
        let mut terminal: Vec<(Uuid, chrono::DateTime<Utc>)> = self
            .runs
            .iter()
            .filter(|(_, e)| e.run.is_terminal())
            .map(|(id, e)| (*id, e.run.completed_at.unwrap_or(e.run.started_at)))
            .collect();
        if terminal.len() <= cap {
            return;
        }
        terminal.sort_by_key(|(_, t)| *t);
        let excess = terminal.len().saturating_sub(cap);
        for (id, _) in terminal.into_iter().take(excess) {
            self.runs.remove(&id);
        }
    }
}

/// The chain execution engine.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<Registry>,
    client: Arc<dyn AgentClient>,
    bus: Arc<EventBus>,
    notifier: Option<Notifier>,
    limits: ExecutionLimits,
    call_permits: Arc<Semaphore>,
    runs: Arc<Mutex<RunTable>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<Registry>,
        client: Arc<dyn AgentClient>,
        bus: Arc<EventBus>,
        limits: ExecutionLimits,
    ) -> Self {
        let call_permits = Arc::new(Semaphore::new(limits.max_parallel_calls));
        Self {
            registry,
            client,
            bus,
            notifier: None,
            limits,
            call_permits,
            runs: Arc::new(Mutex::new(RunTable::default())),
        }
    }

    /// Attach the notification collaborator; terminal chain failures
    /// get a fire-and-forget notify.
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    /// Execute a named chain from the registry.
    #[instrument(skip(self, input), fields(chain = name))]
    pub async fn execute_chain(&self, name: &str, input: Value) -> Result<ChainRun> {
        let chain = self.registry.chain(name)?.clone();
        let deadline = Duration::from_secs(
            chain
                .timeout_seconds
                .unwrap_or(self.limits.chain_timeout_seconds),
        );
        self.run_stages(&chain.name, chain.stages, input, deadline).await
    }

    /// Execute an ad-hoc sequential step list without a named chain.
    #[instrument(skip(self, steps, input))]
    pub async fn execute_ad_hoc(&self, steps: Vec<Step>, input: Value) -> Result<ChainRun> {
        let stages: Vec<Stage> = steps.into_iter().map(Stage::Single).collect();
        let deadline = Duration::from_secs(self.limits.chain_timeout_seconds);
        self.run_stages(AD_HOC_CHAIN, stages, input, deadline).await
    }

    async fn run_stages(
        &self,
        chain_name: &str,
        stages: Vec<Stage>,
        input: Value,
        chain_timeout: Duration,
    ) -> Result<ChainRun> {
        // Fail fast: nothing leaves the process unless the whole
        // definition resolves against the registry
        self.registry.validate_stages(&stages)?;

        let placeholders: Vec<StepResult> = stages
            .iter()
            .flat_map(Stage::steps)
            .map(|s| StepResult::pending(&s.id, &s.agent, &s.action))
            .collect();
        let mut run = ChainRun::new(chain_name, input.clone(), placeholders);
        run.status = RunStatus::Running;

        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut table = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
            table.runs.insert(
                run.id,
                RunEntry {
                    run: run.clone(),
                    cancelled: cancelled.clone(),
                },
            );
        }

        info!(run_id = %run.id, chain = chain_name, "Chain run started");
        self.publish_chain("chain_started", &run, json!({ "chain": chain_name }));

        let deadline = tokio::time::Instant::now() + chain_timeout;
        let mut outputs: HashMap<String, Value> = HashMap::new();
        let mut aborted = false;
        let mut abort_reason: Option<String> = None;

        for stage in &stages {
            if cancelled.load(Ordering::SeqCst) {
                return Ok(self.finish_cancelled(run));
            }

            // A stage is blocked when any member consumes a failed
            // step's output; independent stages keep going
            if let Some(dep) = blocked_on(stage, &run) {
                aborted = true;
                abort_reason = Some(format!("dependency '{}' failed", dep));
                break;
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                aborted = true;
                abort_reason = Some(CHAIN_TIMEOUT.to_string());
                break;
            }
            let remaining = deadline - now;

            // Resolve every member's template before dispatching any
            let ctx = TemplateContext::new(&input, &outputs);
            let mut work: Vec<(Step, Value)> = Vec::new();
            let mut resolution_failure = None;
            for step in stage.steps() {
                match template::resolve(&step.id, &step.params, &ctx) {
                    Ok(params) => work.push((step.clone(), params)),
                    Err(e) => {
                        if let Some(slot) = run.step_mut(&step.id) {
                            slot.mark_failed(e.to_string());
                        }
                        resolution_failure = Some(e.to_string());
                        break;
                    }
                }
            }
            if let Some(reason) = resolution_failure {
                aborted = true;
                abort_reason = Some(reason);
                break;
            }

            let mut handles = Vec::with_capacity(work.len());
            for (step, params) in work {
                let this = self.clone();
                let run_id = run.id;
                let correlation = run.correlation_id;
                handles.push(tokio::spawn(this.run_step(run_id, correlation, step, params)));
            }

            let collected = timeout(remaining, async {
                let mut results = Vec::with_capacity(handles.len());
                for handle in handles {
                    if let Ok(result) = handle.await {
                        results.push(result);
                    }
                }
                results
            })
            .await;

            match collected {
                Ok(results) => {
                    for result in results {
                        if result.status == StepStatus::Succeeded {
                            if let Some(ref output) = result.output {
                                outputs.insert(result.step_id.clone(), output.clone());
                            }
                        }
                        if let Some(slot) = run.step_mut(&result.step_id) {
                            *slot = result;
                        }
                    }
                }
                Err(_) => {
                    // Deadline expired mid-stage; in-flight calls may
                    // finish but their results are discarded
                    aborted = true;
                    abort_reason = Some(CHAIN_TIMEOUT.to_string());
                    break;
                }
            }

            run.total_cost = run.steps.iter().map(|s| s.cost).sum();
            self.store(&run);
        }

        if aborted {
            let reason = abort_reason.as_deref().unwrap_or("aborted").to_string();
            for step in run.steps.iter_mut().filter(|s| {
                matches!(
                    s.status,
                    StepStatus::Pending | StepStatus::Running | StepStatus::Retrying
                )
            }) {
                step.mark_failed(reason.clone());
            }
        }
        run.total_cost = run.steps.iter().map(|s| s.cost).sum();
        run.finish(aborted);
        self.store(&run);

        match run.status {
            RunStatus::Failed => {
                error!(run_id = %run.id, "Chain run failed");
                self.publish_chain(
                    "chain_failed",
                    &run,
                    json!({
                        "reason": abort_reason,
                        "steps": step_summaries(&run),
                    }),
                );
                self.notify_failure(&run);
            }
            _ => {
                info!(run_id = %run.id, status = ?run.status, cost = run.total_cost, "Chain run finished");
                self.publish_chain(
                    "chain_completed",
                    &run,
                    json!({
                        "status": run.status,
                        "total_cost": run.total_cost,
                        "steps": step_summaries(&run),
                    }),
                );
            }
        }

        Ok(run)
    }

    /// Execute one step with retries. Runs on its own task for
    /// parallel stages; permits bound the simultaneous outbound calls.
    async fn run_step(
        self,
        run_id: Uuid,
        correlation: Uuid,
        step: Step,
        params: Value,
    ) -> StepResult {
        let mut result = StepResult::pending(&step.id, &step.agent, &step.action);

        // Post-validation these lookups cannot fail; keep the error
        // path anyway so a racing registry swap stays visible
        let (agent, spec) = match (
            self.registry.agent(&step.agent),
            self.registry.action(&step.agent, &step.action),
        ) {
            (Ok(agent), Ok(spec)) => (agent.clone(), spec.clone()),
            (Err(e), _) | (_, Err(e)) => {
                result.mark_failed(e.to_string());
                return result;
            }
        };
        let step_timeout = step.timeout(&spec);

        result.mark_running();
        if self.update_step(run_id, &result) {
            self.publish_step("step_started", run_id, correlation, &result);
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            result.attempts = attempt;

            let permit = self.call_permits.clone().acquire_owned().await.ok();
            let outcome = timeout(
                step_timeout,
                self.client.call(&agent, &step.action, &params, step_timeout),
            )
            .await;
            drop(permit);

            let call_error = match outcome {
                Ok(Ok(reply)) => {
                    result.cost += reply.cost_usd.unwrap_or(0.0);
                    result.mark_succeeded(reply.payload);
                    if self.update_step(run_id, &result) {
                        self.publish_step("step_succeeded", run_id, correlation, &result);
                    }
                    return result;
                }
                Ok(Err(e)) => e,
                Err(_) => CallError::Timeout {
                    agent: step.agent.clone(),
                    action: step.action.clone(),
                    timeout: step_timeout,
                },
            };

            // Failed attempts still contribute their reported cost
            result.cost += call_error.cost_usd().unwrap_or(0.0);

            if call_error.is_retryable() && attempt <= step.max_retries {
                let delay = step.retry_policy.delay_for_attempt(attempt);
                warn!(
                    step = %step.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %call_error,
                    "Step failed, retrying"
                );

                result.status = StepStatus::Retrying;
                if self.update_step(run_id, &result) {
                    self.publish_step("step_retrying", run_id, correlation, &result);
                }

                tokio::time::sleep(delay).await;
                continue;
            }

            error!(step = %step.id, attempt, error = %call_error, "Step failed permanently");
            result.mark_failed(call_error.to_string());
            if self.update_step(run_id, &result) {
                self.publish_step("step_failed", run_id, correlation, &result);
            }
            return result;
        }
    }

    /// Cancel a run by id: pending steps are marked cancelled and no
    /// new calls are dispatched. In-flight calls are not preempted.
    pub fn cancel_run(&self, run_id: Uuid) -> Result<()> {
        let mut table = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = table
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| anyhow::anyhow!("run {} not found", run_id))?;

        entry.cancelled.store(true, Ordering::SeqCst);
        info!(%run_id, "Chain run cancellation requested");
        Ok(())
    }

    fn finish_cancelled(&self, mut run: ChainRun) -> ChainRun {
        for step in run
            .steps
            .iter_mut()
            .filter(|s| s.status == StepStatus::Pending)
        {
            step.mark_cancelled();
        }
        run.status = RunStatus::Cancelled;
        run.completed_at = Some(Utc::now());
        run.total_cost = run.steps.iter().map(|s| s.cost).sum();
        self.store(&run);
        self.publish_chain("chain_failed", &run, json!({ "reason": "cancelled" }));
        run
    }

    /// Snapshot of a run; eventually consistent for live runs.
    pub fn get_run(&self, run_id: Uuid) -> Option<ChainRun> {
        let table = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        table.runs.get(&run_id).map(|e| e.run.clone())
    }

    /// Recent runs, newest first.
    pub fn list_runs(&self, limit: usize) -> Vec<ChainRun> {
        let table = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut runs: Vec<ChainRun> = table.runs.values().map(|e| e.run.clone()).collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        runs
    }

    /// Engine liveness: the registry loaded and the bus answers.
    pub fn health_check(&self) -> Result<()> {
        self.bus.health_check()?;
        Ok(())
    }

    fn store(&self, run: &ChainRun) {
        let mut table = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = table.runs.get_mut(&run.id) {
            entry.run = run.clone();
        }
        if run.is_terminal() {
            table.evict_terminal(self.limits.run_retention);
        }
    }

    /// Write a step result back into the stored run. Returns false when
    /// the run has already settled, in which case the result is dropped:
    /// a call still in flight when the chain deadline fired must not
    /// rewrite a terminal run or emit step events after the chain's
    /// final event.
    fn update_step(&self, run_id: Uuid, result: &StepResult) -> bool {
        let mut table = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        match table.runs.get_mut(&run_id) {
            Some(entry) if !entry.run.is_terminal() => {
                if let Some(slot) = entry.run.step_mut(&result.step_id) {
                    *slot = result.clone();
                }
                true
            }
            _ => false,
        }
    }

    fn publish_chain(&self, action: &str, run: &ChainRun, mut details: Value) {
        details["run_id"] = json!(run.id);
        details["correlation_id"] = json!(run.correlation_id);
        details["chain"] = json!(run.chain_name);
        if let Err(e) = self.bus.publish("orchestrator", action, None, details, None) {
            warn!(error = %e, action, "Event bus publish failed");
        }
    }

    fn publish_step(&self, action: &str, run_id: Uuid, correlation: Uuid, result: &StepResult) {
        let details = json!({
            "run_id": run_id,
            "correlation_id": correlation,
            "step_id": result.step_id,
            "agent": result.agent,
            "action": result.action,
            "attempt": result.attempts,
            "error": result.error,
        });
        if let Err(e) = self
            .bus
            .publish("orchestrator", action, Some(&result.agent), details, None)
        {
            warn!(error = %e, action, "Event bus publish failed");
        }
    }

    fn notify_failure(&self, run: &ChainRun) {
        if let Some(ref notifier) = self.notifier {
            let failed: Vec<&str> = run
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Failed)
                .map(|s| s.step_id.as_str())
                .collect();
            notifier.notify(Notification {
                message: format!(
                    "Chain '{}' (run {}) failed; failed steps: {}",
                    run.chain_name,
                    run.id,
                    failed.join(", ")
                ),
                priority: Priority::High,
                channel: None,
            });
        }
    }
}

/// First failed dependency a stage member consumes, if any.
fn blocked_on(stage: &Stage, run: &ChainRun) -> Option<String> {
    for step in stage.steps() {
        for token in template::tokens(&step.params) {
            if token.root == template::INPUT_ROOT {
                continue;
            }
            let failed = run
                .step(&token.root)
                .map(|s| s.status == StepStatus::Failed)
                .unwrap_or(false);
            if failed {
                return Some(token.root);
            }
        }
    }
    None
}

/// Per-step detail for terminal chain events: operators can always
/// pinpoint the offending step and cause.
fn step_summaries(run: &ChainRun) -> Value {
    Value::Array(
        run.steps
            .iter()
            .map(|s| {
                json!({
                    "step_id": s.step_id,
                    "status": s.status,
                    "attempts": s.attempts,
                    "error": s.error,
                    "cost": s.cost,
                })
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_run_eviction_keeps_newest() {
        let mut table = RunTable::default();
        for i in 0..5 {
            let mut run = ChainRun::new("c", Value::Null, Vec::new());
            run.status = RunStatus::Completed;
            run.completed_at = Some(Utc::now() + chrono::Duration::seconds(i));
            table.runs.insert(
                run.id,
                RunEntry {
                    run,
                    cancelled: Arc::new(AtomicBool::new(false)),
                },
            );
        }

        table.evict_terminal(2);
        assert_eq!(table.runs.len(), 2);
    }

    #[test]
    fn test_live_runs_never_evicted() {
        let mut table = RunTable::default();
        for _ in 0..3 {
            let mut run = ChainRun::new("c", Value::Null, Vec::new());
            run.status = RunStatus::Running;
            table.runs.insert(
                run.id,
                RunEntry {
                    run,
                    cancelled: Arc::new(AtomicBool::new(false)),
                },
            );
        }

        table.evict_terminal(1);
        assert_eq!(table.runs.len(), 3);
    }

    #[test]
    fn test_default_limits() {
        let limits = ExecutionLimits::default();
        assert_eq!(limits.max_parallel_calls, 8);
        assert_eq!(limits.chain_timeout_seconds, 3600);
    }
}
