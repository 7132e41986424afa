//! Adapter interfaces for external systems.
//!
//! Adapters wrap everything that leaves the process: agent action
//! endpoints, the remote orchestrator runtime, and the notification
//! collaborator.

pub mod http;
pub mod notifier;
pub mod remote;

use std::time::Duration;

use async_trait::async_trait;

pub use http::HttpAgentClient;
pub use notifier::{Notification, Notifier, Priority};
pub use remote::RemoteOrchestrator;

use crate::core::registry::AgentDescriptor;
use crate::error::CallError;

/// Successful reply from an agent action.
#[derive(Debug, Clone)]
pub struct AgentReply {
    /// Payload the agent returned
    pub payload: serde_json::Value,

    /// Cost the agent reports for this call, if any
    pub cost_usd: Option<f64>,
}

impl AgentReply {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            cost_usd: None,
        }
    }
}

/// Outbound interface to registered agents.
///
/// Timeouts are enforced by the caller, never assumed from the callee.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Invoke one action on an agent.
    async fn call(
        &self,
        agent: &AgentDescriptor,
        action: &str,
        params: &serde_json::Value,
        timeout: Duration,
    ) -> Result<AgentReply, CallError>;

    /// Probe an agent's health endpoint (up/down).
    async fn probe(&self, location: &str) -> Result<(), CallError>;
}
