//! Agent registry and chain definitions.
//!
//! The registry is defined in YAML and loaded once: agent locations and
//! their actions (with per-action timeouts), plus named chains built
//! from ordered stages. It is immutable after load and shared by
//! handle; a reload replaces the whole object atomically rather than
//! mutating in place.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::template;
use crate::error::DefinitionError;

/// Immutable agent and chain registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    /// Schema version of the registry file
    pub version: String,

    /// Agent name -> descriptor
    #[serde(default)]
    pub agents: HashMap<String, AgentDescriptor>,

    /// Chain name -> definition
    #[serde(default)]
    pub chains: HashMap<String, Chain>,
}

impl Registry {
    /// Load a registry from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read registry file: {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse a registry from YAML content and validate every chain.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut registry: Registry =
            serde_yaml::from_str(content).context("Failed to parse registry YAML")?;

        // Map keys are authoritative for names
        for (name, agent) in registry.agents.iter_mut() {
            agent.name = name.clone();
        }
        for (name, chain) in registry.chains.iter_mut() {
            chain.name = name.clone();
        }

        for chain in registry.chains.values() {
            registry
                .validate_stages(&chain.stages)
                .with_context(|| format!("chain '{}' failed validation", chain.name))?;
        }

        Ok(registry)
    }

    pub fn agent(&self, name: &str) -> Result<&AgentDescriptor, DefinitionError> {
        self.agents
            .get(name)
            .ok_or_else(|| DefinitionError::UnknownAgent(name.to_string()))
    }

    pub fn action(&self, agent: &str, action: &str) -> Result<&ActionSpec, DefinitionError> {
        self.agent(agent)?
            .actions
            .get(action)
            .ok_or_else(|| DefinitionError::UnknownAction {
                agent: agent.to_string(),
                action: action.to_string(),
            })
    }

    pub fn chain(&self, name: &str) -> Result<&Chain, DefinitionError> {
        self.chains
            .get(name)
            .ok_or_else(|| DefinitionError::UnknownChain(name.to_string()))
    }

    /// Agent names, sorted; used for sync validation across runtimes.
    pub fn agent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }

    /// Validate a stage list without executing anything.
    ///
    /// Checks, in order: at least one step, unique step ids, every
    /// agent/action resolves, every template root is `input` or a step
    /// id, no reference cycles, and no step references another before
    /// it has produced output.
    pub fn validate_stages(&self, stages: &[Stage]) -> Result<(), DefinitionError> {
        let mut positions: HashMap<&str, usize> = HashMap::new();
        let mut ordered: Vec<&Step> = Vec::new();

        for (stage_idx, stage) in stages.iter().enumerate() {
            for step in stage.steps() {
                if positions.insert(step.id.as_str(), stage_idx).is_some() {
                    return Err(DefinitionError::DuplicateStep(step.id.clone()));
                }
                ordered.push(step);
            }
        }

        if ordered.is_empty() {
            return Err(DefinitionError::EmptyChain);
        }

        // References must resolve before we reason about ordering
        let mut refs: HashMap<&str, Vec<String>> = HashMap::new();
        for step in &ordered {
            self.action(&step.agent, &step.action)?;

            let mut roots = Vec::new();
            for token in template::tokens(&step.params) {
                if token.root == template::INPUT_ROOT {
                    continue;
                }
                if !positions.contains_key(token.root.as_str()) {
                    return Err(DefinitionError::UnresolvedReference {
                        step: step.id.clone(),
                        reference: token.root,
                    });
                }
                roots.push(token.root);
            }
            refs.insert(step.id.as_str(), roots);
        }

        detect_cycle(&refs)?;

        // A step may only consume output of strictly earlier stages
        for step in &ordered {
            let own_stage = positions[step.id.as_str()];
            for reference in &refs[step.id.as_str()] {
                if positions[reference.as_str()] >= own_stage {
                    return Err(DefinitionError::ForwardReference {
                        step: step.id.clone(),
                        reference: reference.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Depth-first walk over the step reference graph.
fn detect_cycle(refs: &HashMap<&str, Vec<String>>) -> Result<(), DefinitionError> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut on_path: HashSet<&str> = HashSet::new();

    fn visit<'a>(
        node: &'a str,
        refs: &'a HashMap<&str, Vec<String>>,
        visited: &mut HashSet<&'a str>,
        on_path: &mut HashSet<&'a str>,
    ) -> Result<(), DefinitionError> {
        if on_path.contains(node) {
            return Err(DefinitionError::DependencyCycle(node.to_string()));
        }
        if !visited.insert(node) {
            return Ok(());
        }
        on_path.insert(node);
        if let Some(targets) = refs.get(node) {
            for target in targets {
                visit(target, refs, visited, on_path)?;
            }
        }
        on_path.remove(node);
        Ok(())
    }

    for node in refs.keys() {
        visit(node, refs, &mut visited, &mut on_path)?;
    }
    Ok(())
}

/// A registered agent: where it lives and what it can do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Agent name; filled from the registry map key
    #[serde(default)]
    pub name: String,

    /// Base URL of the agent's HTTP surface
    pub location: String,

    /// Action name -> spec
    #[serde(default)]
    pub actions: HashMap<String, ActionSpec>,
}

/// Declared shape of one agent action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Parameter schema, documentation-grade (not enforced here;
    /// idempotency and validation are the callee's responsibility)
    #[serde(default)]
    pub params: serde_json::Value,

    /// Per-call timeout for this action
    #[serde(default = "default_action_timeout")]
    pub timeout_seconds: u64,
}

impl ActionSpec {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_action_timeout() -> u64 {
    30
}

impl Default for ActionSpec {
    fn default() -> Self {
        Self {
            params: serde_json::Value::Null,
            timeout_seconds: default_action_timeout(),
        }
    }
}

/// A named, reusable multi-step workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    /// Chain name; filled from the registry map key
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Ordered stages; each is one step or a parallel step set
    pub stages: Vec<Stage>,

    /// Deadline for the whole run (uses the engine default if not set)
    pub timeout_seconds: Option<u64>,
}

/// One stage of a chain: a single step, or steps that run concurrently.
///
/// YAML forms:
/// - Single: a plain step mapping
/// - Parallel: `{ parallel: [step, step] }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Stage {
    Parallel { parallel: Vec<Step> },
    Single(Step),
}

impl Stage {
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        match self {
            Self::Single(step) => std::slice::from_ref(step).iter(),
            Self::Parallel { parallel } => parallel.iter(),
        }
    }
}

/// One unit of work targeting a single agent action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step id, unique within the chain
    pub id: String,

    /// Target agent name
    pub agent: String,

    /// Action on the target agent
    pub action: String,

    /// Parameter template; may embed `{{input.*}}` or
    /// `{{<step-id>.*}}` tokens
    #[serde(default)]
    pub params: serde_json::Value,

    /// Retries after the first failed attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Override the action's timeout for this step
    pub timeout_seconds: Option<u64>,

    /// Delay shape between retry attempts
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

impl Step {
    /// Effective timeout: step override, else the action's declared one.
    pub fn timeout(&self, spec: &ActionSpec) -> Duration {
        self.timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or_else(|| spec.timeout())
    }
}

fn default_max_retries() -> u32 {
    2
}

/// Backoff shape for retried steps. Attempt counts live on the step
/// (`max_retries`); this only controls the delay between attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Cap on the delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Delay multiplier applied after each retry
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_initial_delay() -> u64 {
    500
}
fn default_max_delay() -> u64 {
    15000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);
        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }
}
