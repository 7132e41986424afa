//! Error taxonomy for the orchestration substrate.
//!
//! Three families, matching how errors propagate:
//! - [`DefinitionError`]: a chain, step, or registry reference is wrong.
//!   Raised before any network call, never retried, reported verbatim.
//! - [`CallError`]: an outbound agent call failed. Absorbed into retry
//!   logic and escalates only after the step's retry budget is spent.
//! - [`BusError`]: an Event Bus operation failed. State errors
//!   (double-respond, unknown event) surface immediately; write
//!   failures are logged and swallowed at orchestration call sites.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// A chain or step definition does not resolve against the registry.
///
/// These fail fast during validation, before any network call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("unknown agent '{0}'")]
    UnknownAgent(String),

    #[error("agent '{agent}' has no action '{action}'")]
    UnknownAction { agent: String, action: String },

    #[error("chain '{0}' is not defined in the registry")]
    UnknownChain(String),

    #[error("chain has no steps")]
    EmptyChain,

    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),

    #[error(
        "step '{step}' references '{reference}', which is neither the chain input nor a step id"
    )]
    UnresolvedReference { step: String, reference: String },

    #[error("step '{step}' references step '{reference}' before it has produced output")]
    ForwardReference { step: String, reference: String },

    #[error("dependency cycle involving step '{0}'")]
    DependencyCycle(String),

    #[error("template path '{path}' does not resolve in the output of '{root}'")]
    BadPath { root: String, path: String },
}

/// An outbound call to an agent failed.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("transport error calling {agent}/{action}: {source}")]
    Transport {
        agent: String,
        action: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{agent}/{action} timed out after {timeout:?}")]
    Timeout {
        agent: String,
        action: String,
        timeout: Duration,
    },

    /// The agent answered, but reported a failure.
    #[error("{agent}/{action} returned status {status}: {message}")]
    Agent {
        agent: String,
        action: String,
        status: u16,
        message: String,
        /// Whether the agent marked the failure as retryable.
        retryable: bool,
        /// Cost the agent reports for the failed attempt, if any.
        cost_usd: Option<f64>,
    },
}

impl CallError {
    /// Transport failures and timeouts always retry; agent failures
    /// retry unless the agent explicitly marked them non-retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } => true,
            Self::Agent { retryable, .. } => *retryable,
        }
    }

    /// Cost reported by the failed attempt, if the agent included one.
    pub fn cost_usd(&self) -> Option<f64> {
        match self {
            Self::Agent { cost_usd, .. } => *cost_usd,
            _ => None,
        }
    }
}

/// An Event Bus operation failed.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("event action cannot be empty")]
    InvalidEvent,

    #[error("event {0} not found")]
    NotFound(Uuid),

    #[error("invalid state for event {id}: {reason}")]
    InvalidState { id: Uuid, reason: String },

    #[error("event storage error")]
    Storage(#[from] rusqlite::Error),

    #[error("event serialization error")]
    Codec(#[from] serde_json::Error),
}
