//! Shared test doubles: a scriptable agent client and orchestrator
//! runtime stand-ins.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use agentmesh::adapters::{AgentClient, AgentReply};
use agentmesh::core::registry::AgentDescriptor;
use agentmesh::core::router::{ChainExecutor, RouteRequest};
use agentmesh::core::{ExecutionLimits, Orchestrator, Registry};
use agentmesh::error::CallError;
use agentmesh::{ChainRun, EventBus};

/// One scripted outcome for a mock agent call.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Reply with this payload and cost
    Succeed(Value, f64),
    /// Fail with a message; `retryable` drives the engine's retry loop
    Fail {
        message: String,
        retryable: bool,
        cost: f64,
    },
    /// Sleep long enough for the caller's timeout to fire
    Hang(Duration),
}

/// A recorded call, in arrival order.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub agent: String,
    pub action: String,
    pub params: Value,
    pub at: DateTime<Utc>,
}

/// Scriptable in-process agent client.
///
/// Outcomes are queued per `agent/action` key and consumed in order;
/// once a queue drains the call succeeds with an echo payload. Calls
/// are recorded, and the peak number of in-flight calls is tracked so
/// tests can assert concurrency caps.
pub struct MockAgent {
    scripts: Mutex<HashMap<String, VecDeque<Outcome>>>,
    calls: Mutex<Vec<CallRecord>>,
    delay: Option<Duration>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockAgent {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            delay: None,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Every call sleeps this long before resolving; used to observe
    /// overlap between parallel calls.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn script(&self, agent: &str, action: &str, outcome: Outcome) {
        let mut scripts = self.scripts.lock().unwrap_or_else(PoisonError::into_inner);
        scripts
            .entry(format!("{}/{}", agent, action))
            .or_default()
            .push_back(outcome);
    }

    /// Queue `n` retryable failures followed by one success.
    pub fn fail_then_succeed(&self, agent: &str, action: &str, n: usize) {
        for i in 0..n {
            self.script(
                agent,
                action,
                Outcome::Fail {
                    message: format!("transient failure {}", i + 1),
                    retryable: true,
                    cost: 0.0,
                },
            );
        }
        self.script(agent, action, Outcome::Succeed(json!({"ok": true}), 0.0));
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, key: &str) -> Option<Outcome> {
        let mut scripts = self.scripts.lock().unwrap_or_else(PoisonError::into_inner);
        scripts.get_mut(key).and_then(|queue| queue.pop_front())
    }
}

#[async_trait]
impl AgentClient for MockAgent {
    async fn call(
        &self,
        agent: &AgentDescriptor,
        action: &str,
        params: &Value,
        _timeout: Duration,
    ) -> Result<AgentReply, CallError> {
        {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            calls.push(CallRecord {
                agent: agent.name.clone(),
                action: action.to_string(),
                params: params.clone(),
                at: Utc::now(),
            });
        }

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let key = format!("{}/{}", agent.name, action);
        let outcome = self
            .next_outcome(&key)
            .unwrap_or_else(|| Outcome::Succeed(json!({"echo": params.clone()}), 0.0));

        let result = match outcome {
            Outcome::Succeed(payload, cost) => Ok(AgentReply {
                payload,
                cost_usd: Some(cost),
            }),
            Outcome::Fail {
                message,
                retryable,
                cost,
            } => Err(CallError::Agent {
                agent: agent.name.clone(),
                action: action.to_string(),
                status: if retryable { 503 } else { 422 },
                message,
                retryable,
                cost_usd: Some(cost),
            }),
            Outcome::Hang(duration) => {
                tokio::time::sleep(duration).await;
                Ok(AgentReply {
                    payload: json!(null),
                    cost_usd: None,
                })
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn probe(&self, _location: &str) -> Result<(), CallError> {
        Ok(())
    }
}

/// Orchestrator runtime stand-in with a switchable health result.
pub struct MockExecutor {
    name: &'static str,
    healthy: Mutex<bool>,
    agents: Vec<String>,
    executions: AtomicUsize,
}

impl MockExecutor {
    pub fn new(name: &'static str, agents: &[&str]) -> Self {
        Self {
            name,
            healthy: Mutex::new(true),
            agents: agents.iter().map(|a| a.to_string()).collect(),
            executions: AtomicUsize::new(0),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        *self.healthy.lock().unwrap_or_else(PoisonError::into_inner) = healthy;
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainExecutor for MockExecutor {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self, request: RouteRequest) -> Result<ChainRun> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let mut run = ChainRun::new(
            request.chain.as_deref().unwrap_or("ad-hoc"),
            request.input,
            Vec::new(),
        );
        run.finish(false);
        Ok(run)
    }

    async fn health(&self) -> Result<()> {
        if *self.healthy.lock().unwrap_or_else(PoisonError::into_inner) {
            Ok(())
        } else {
            anyhow::bail!("{} is down", self.name)
        }
    }

    async fn known_agents(&self) -> Result<Vec<String>> {
        Ok(self.agents.clone())
    }
}

/// Registry fixture shared by the integration tests.
pub const REGISTRY_YAML: &str = r#"
version: "1.0"

agents:
  researcher:
    location: http://localhost:9101
    actions:
      search:
        timeout_seconds: 5
      fetch:
        timeout_seconds: 5
  writer:
    location: http://localhost:9102
    actions:
      draft:
        timeout_seconds: 5
      polish:
        timeout_seconds: 5

chains:
  research_and_write:
    description: Search, then draft from the results
    stages:
      - id: search
        agent: researcher
        action: search
        params:
          query: "{{input.topic}}"
      - id: draft
        agent: writer
        action: draft
        params:
          source: "{{search.echo.query}}"
"#;

pub fn registry() -> Registry {
    Registry::from_yaml(REGISTRY_YAML).unwrap()
}

/// Engine wired to an in-memory bus and the given mock client.
pub fn orchestrator(mock: Arc<MockAgent>, limits: ExecutionLimits) -> Orchestrator {
    let bus = Arc::new(EventBus::in_memory().unwrap());
    Orchestrator::new(Arc::new(registry()), mock, bus, limits)
}

pub fn orchestrator_with_bus(
    mock: Arc<MockAgent>,
    limits: ExecutionLimits,
    bus: Arc<EventBus>,
) -> Orchestrator {
    Orchestrator::new(Arc::new(registry()), mock, bus, limits)
}
