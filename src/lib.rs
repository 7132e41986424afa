//! agentmesh - Multi-agent orchestration substrate
//!
//! Coordination layer that lets many independent service agents
//! cooperate safely.
//!
//! # Architecture
//!
//! Three cooperating pieces, leaf to root:
//! - An append-mostly **Event Bus**: durable, queryable coordination and
//!   audit log with pattern-matched subscriber computation and an
//!   optional human-in-the-loop response lifecycle
//! - A **Chain Execution Engine**: runs named chains or ad-hoc step
//!   lists against registered agents, with template resolution,
//!   sequential/parallel staging, retries, timeouts, and cost accounting
//! - A **Smart Router**: classifies requests structurally and fails
//!   over between two orchestrator implementations based on live health
//!
//! Every transition is mirrored onto the Event Bus; bus write failures
//! never abort an otherwise-successful operation.
//!
//! # Modules
//!
//! - `adapters`: External system integrations (agent HTTP endpoints,
//!   remote orchestrator, notification collaborator)
//! - `core`: Orchestration logic (EventBus, Orchestrator, Router)
//! - `domain`: Data structures (Event, ChainRun, Batch)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Execute a named chain
//! echo '{"ticker": "AAPL"}' | agentmesh run daily-briefing
//!
//! # Call a single agent action directly
//! agentmesh call pricing quote --params '{"symbol": "AAPL"}'
//!
//! # Inspect the event log
//! agentmesh events --action chain_failed --limit 20
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;

// Re-export main types at crate root for convenience
pub use crate::core::{BatchRunner, EventBus, Orchestrator, Router};
pub use domain::{Batch, ChainRun, Event, EventStatus, RunStatus, StepResult, StepStatus};
pub use error::{BusError, CallError, DefinitionError};
