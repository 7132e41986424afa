//! Smart router: the system's front door.
//!
//! Classifies incoming requests structurally (never semantically),
//! dispatches simple single-agent calls directly for lower latency,
//! and routes complex requests to whichever orchestrator
//! implementation is currently healthy. Failover is driven by a
//! circuit breaker fed from periodic health probes with hysteresis:
//! consecutive probe failures trip it, consecutive successes restore.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::{info, instrument, warn};

use crate::adapters::AgentClient;
use crate::domain::{ChainRun, RunStatus, StepResult};

use super::bus::EventBus;
use super::orchestrator::Orchestrator;
use super::registry::{Registry, RetryPolicy, Step};
use super::template::{self, TemplateContext};

/// Structural complexity of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    /// One named agent action with no inter-step dependency
    Simple,

    /// A named chain, or any multi-step request
    Complex,
}

/// A request at the front door: either a named chain or a step list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRequest {
    /// Named chain to execute, if any
    pub chain: Option<String>,

    /// Ad-hoc steps when no chain is named
    #[serde(default)]
    pub steps: Vec<Step>,

    #[serde(default)]
    pub input: Value,
}

impl RouteRequest {
    pub fn chain(name: &str, input: Value) -> Self {
        Self {
            chain: Some(name.to_string()),
            steps: Vec::new(),
            input,
        }
    }

    pub fn single(agent: &str, action: &str, params: Value, input: Value) -> Self {
        Self {
            chain: None,
            steps: vec![Step {
                id: "call".to_string(),
                agent: agent.to_string(),
                action: action.to_string(),
                params,
                max_retries: 0,
                timeout_seconds: None,
                retry_policy: RetryPolicy::default(),
            }],
            input,
        }
    }

    pub fn ad_hoc(steps: Vec<Step>, input: Value) -> Self {
        Self {
            chain: None,
            steps,
            input,
        }
    }
}

/// Strategy seam between the router and an orchestrator runtime.
///
/// Two implementations exist: the in-process engine and the remote
/// runtime the router fails over to.
#[async_trait]
pub trait ChainExecutor: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, request: RouteRequest) -> Result<ChainRun>;

    async fn health(&self) -> Result<()>;

    /// Agent names this runtime can dispatch to; used for sync checks.
    async fn known_agents(&self) -> Result<Vec<String>>;
}

#[async_trait]
impl ChainExecutor for Orchestrator {
    fn name(&self) -> &str {
        "local"
    }

    async fn execute(&self, request: RouteRequest) -> Result<ChainRun> {
        match request.chain {
            Some(ref name) => self.execute_chain(name, request.input).await,
            None => self.execute_ad_hoc(request.steps, request.input).await,
        }
    }

    async fn health(&self) -> Result<()> {
        self.health_check()
    }

    async fn known_agents(&self) -> Result<Vec<String>> {
        Ok(self.registry().agent_names())
    }
}

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Traffic flows normally
    Closed,

    /// Tripped; traffic routes to the alternate
    Open,

    /// Probes succeed but the restore threshold is not yet met
    HalfOpen,
}

/// Operator-facing health of one implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Consecutive-count circuit breaker with hysteresis.
///
/// `failure_threshold` consecutive probe failures trip it open;
/// `success_threshold` consecutive successes close it again. The two
/// thresholds are independent, which is what prevents flapping.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    success_threshold: u32,
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, success_threshold: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            state: BreakerState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }

    pub fn record_failure(&mut self) {
        self.consecutive_successes = 0;
        self.consecutive_failures += 1;
        match self.state {
            BreakerState::Closed if self.consecutive_failures >= self.failure_threshold => {
                self.state = BreakerState::Open;
            }
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
            }
            _ => {}
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;
        match self.state {
            BreakerState::Closed => {}
            _ if self.consecutive_successes >= self.success_threshold => {
                self.state = BreakerState::Closed;
                self.consecutive_successes = 0;
            }
            BreakerState::Open => {
                self.state = BreakerState::HalfOpen;
            }
            _ => {}
        }
    }

    /// Traffic goes through only while fully closed; half-open still
    /// routes to the alternate until the restore threshold is met.
    pub fn allows_traffic(&self) -> bool {
        self.state == BreakerState::Closed
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn health_state(&self) -> HealthState {
        match self.state {
            BreakerState::Closed if self.consecutive_failures == 0 => HealthState::Healthy,
            BreakerState::Closed | BreakerState::HalfOpen => HealthState::Degraded,
            BreakerState::Open => HealthState::Unhealthy,
        }
    }
}

/// Router tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Consecutive probe failures before failing over
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive probe successes before restoring
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_probe_interval")]
    pub probe_interval_seconds: u64,
}

fn default_failure_threshold() -> u32 {
    3
}
fn default_success_threshold() -> u32 {
    5
}
fn default_probe_interval() -> u64 {
    10
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            probe_interval_seconds: default_probe_interval(),
        }
    }
}

/// Aggregated health the operational surface reports.
#[derive(Debug, Clone, Serialize)]
pub struct RouterHealth {
    pub primary: HealthState,
    pub secondary: HealthState,
    pub routing_to: String,
}

/// Registry drift between the two implementations; warnings only.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub in_sync: bool,
    pub warnings: Vec<String>,
}

/// The front door.
pub struct Router {
    primary: Arc<dyn ChainExecutor>,
    secondary: Arc<dyn ChainExecutor>,
    registry: Arc<Registry>,
    client: Arc<dyn AgentClient>,
    bus: Arc<EventBus>,
    primary_breaker: Mutex<CircuitBreaker>,
    secondary_breaker: Mutex<CircuitBreaker>,
    config: RouterConfig,
}

impl Router {
    pub fn new(
        primary: Arc<dyn ChainExecutor>,
        secondary: Arc<dyn ChainExecutor>,
        registry: Arc<Registry>,
        client: Arc<dyn AgentClient>,
        bus: Arc<EventBus>,
        config: RouterConfig,
    ) -> Self {
        let breaker = CircuitBreaker::new(config.failure_threshold, config.success_threshold);
        Self {
            primary,
            secondary,
            registry,
            client,
            bus,
            primary_breaker: Mutex::new(breaker.clone()),
            secondary_breaker: Mutex::new(breaker),
            config,
        }
    }

    /// Structural classification: step count and known action shape,
    /// never content. Deterministic and side-effect-free.
    pub fn classify(&self, request: &RouteRequest) -> Complexity {
        if request.chain.is_some() || request.steps.len() != 1 {
            return Complexity::Complex;
        }
        let step = &request.steps[0];
        let has_step_refs = template::tokens(&step.params)
            .iter()
            .any(|t| t.root != template::INPUT_ROOT);
        if has_step_refs {
            Complexity::Complex
        } else {
            Complexity::Simple
        }
    }

    /// Dispatch a request to wherever it should run.
    #[instrument(skip(self, request))]
    pub async fn dispatch(&self, request: RouteRequest) -> Result<ChainRun> {
        let complexity = self.classify(&request);
        match complexity {
            Complexity::Simple => {
                self.publish_routing(&request, complexity, "direct");
                self.dispatch_direct(request).await
            }
            Complexity::Complex => {
                let target = self.routing_target();
                self.publish_routing(&request, complexity, target.name());
                target.execute(request).await
            }
        }
    }

    /// Simple requests skip the engine: one direct call, no retries.
    async fn dispatch_direct(&self, request: RouteRequest) -> Result<ChainRun> {
        let Some(step) = request.steps.into_iter().next() else {
            anyhow::bail!("simple request carried no step");
        };

        let agent = self.registry.agent(&step.agent)?.clone();
        let spec = self.registry.action(&step.agent, &step.action)?.clone();

        let outputs = HashMap::new();
        let ctx = TemplateContext::new(&request.input, &outputs);
        let params = template::resolve(&step.id, &step.params, &ctx)?;

        let mut result = StepResult::pending(&step.id, &step.agent, &step.action);
        let mut run = ChainRun::new(
            crate::domain::run::AD_HOC_CHAIN,
            request.input,
            Vec::new(),
        );
        run.status = RunStatus::Running;

        result.mark_running();
        result.attempts = 1;

        let step_timeout = step.timeout(&spec);
        let outcome = timeout(
            step_timeout,
            self.client.call(&agent, &step.action, &params, step_timeout),
        )
        .await;

        let failed = match outcome {
            Ok(Ok(reply)) => {
                result.cost += reply.cost_usd.unwrap_or(0.0);
                result.mark_succeeded(reply.payload);
                false
            }
            Ok(Err(e)) => {
                result.cost += e.cost_usd().unwrap_or(0.0);
                result.mark_failed(e.to_string());
                true
            }
            Err(_) => {
                result.mark_failed(format!(
                    "{}/{} timed out after {:?}",
                    step.agent, step.action, step_timeout
                ));
                true
            }
        };

        run.total_cost = result.cost;
        run.steps.push(result);
        run.finish(failed);
        Ok(run)
    }

    /// Where complex traffic currently goes. Prefers the primary; the
    /// secondary takes over only while its own breaker still allows.
    fn routing_target(&self) -> Arc<dyn ChainExecutor> {
        let primary_ok = self
            .primary_breaker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allows_traffic();
        if primary_ok {
            return self.primary.clone();
        }
        let secondary_ok = self
            .secondary_breaker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allows_traffic();
        if secondary_ok {
            self.secondary.clone()
        } else {
            // Both tripped: fail toward the preferred implementation
            self.primary.clone()
        }
    }

    pub fn routing_to(&self) -> String {
        self.routing_target().name().to_string()
    }

    /// One probe round against both implementations. The periodic
    /// monitor calls this; tests drive it directly.
    pub async fn probe_once(&self) {
        let primary_result = self.primary.health().await;
        self.record_probe(&self.primary_breaker, "primary", primary_result.is_ok());

        let secondary_result = self.secondary.health().await;
        self.record_probe(&self.secondary_breaker, "secondary", secondary_result.is_ok());
    }

    fn record_probe(&self, breaker: &Mutex<CircuitBreaker>, which: &str, ok: bool) {
        let mut breaker = breaker.lock().unwrap_or_else(PoisonError::into_inner);
        let before = breaker.state();
        if ok {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }
        let after = breaker.state();

        if before != after {
            warn!(implementation = which, ?before, ?after, "Breaker state changed");
            let details = json!({
                "implementation": which,
                "from": before,
                "to": after,
            });
            if let Err(e) = self
                .bus
                .publish("router", "breaker_transition", None, details, None)
            {
                warn!(error = %e, "Event bus publish failed");
            }
        }
    }

    /// Spawn the periodic health monitor.
    pub fn spawn_health_monitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let router = self.clone();
        let interval = Duration::from_secs(self.config.probe_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick would count a probe before
            // anything is up; skip it
            ticker.tick().await;
            loop {
                ticker.tick().await;
                router.probe_once().await;
            }
        })
    }

    pub fn health_report(&self) -> RouterHealth {
        let primary = self
            .primary_breaker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .health_state();
        let secondary = self
            .secondary_breaker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .health_state();
        RouterHealth {
            primary,
            secondary,
            routing_to: self.routing_to(),
        }
    }

    /// Compare the agent sets both implementations can see. Drift is
    /// reported as warnings and never mutates anything.
    pub async fn validate_sync(&self) -> SyncReport {
        let mut warnings = Vec::new();

        let primary = self.primary.known_agents().await;
        let secondary = self.secondary.known_agents().await;

        match (primary, secondary) {
            (Ok(primary), Ok(secondary)) => {
                for agent in primary.iter().filter(|a| !secondary.contains(a)) {
                    warnings.push(format!("agent '{}' missing on secondary", agent));
                }
                for agent in secondary.iter().filter(|a| !primary.contains(a)) {
                    warnings.push(format!("agent '{}' missing on primary", agent));
                }
            }
            (Err(e), _) => warnings.push(format!("primary registry unavailable: {}", e)),
            (_, Err(e)) => warnings.push(format!("secondary registry unavailable: {}", e)),
        }

        if !warnings.is_empty() {
            info!(count = warnings.len(), "Registry drift detected");
        }
        SyncReport {
            in_sync: warnings.is_empty(),
            warnings,
        }
    }

    fn publish_routing(&self, request: &RouteRequest, complexity: Complexity, target: &str) {
        let details = json!({
            "complexity": complexity,
            "chain": request.chain,
            "steps": request.steps.len(),
            "target": target,
        });
        if let Err(e) = self
            .bus
            .publish("router", "request_routed", None, details, None)
        {
            warn!(error = %e, "Event bus publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_trips_after_threshold() {
        let mut breaker = CircuitBreaker::new(3, 5);
        assert!(breaker.allows_traffic());

        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.allows_traffic());
        assert_eq!(breaker.health_state(), HealthState::Degraded);

        breaker.record_failure();
        assert!(!breaker.allows_traffic());
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.health_state(), HealthState::Unhealthy);
    }

    #[test]
    fn test_breaker_restores_after_successes() {
        let mut breaker = CircuitBreaker::new(3, 5);
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        // Four successes are not enough
        for _ in 0..4 {
            breaker.record_success();
        }
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(!breaker.allows_traffic());

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allows_traffic());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let mut breaker = CircuitBreaker::new(3, 5);
        for _ in 0..3 {
            breaker.record_failure();
        }
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        // The success streak starts over
        for _ in 0..5 {
            breaker.record_success();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_failure_streak_interrupted_by_success() {
        let mut breaker = CircuitBreaker::new(3, 5);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        // Never three in a row
        assert!(breaker.allows_traffic());
    }
}
