//! Core orchestration logic.
//!
//! - `bus`: durable coordination/audit log with pattern subscriptions
//! - `registry`: immutable agent and chain definitions
//! - `template`: `{{source.path}}` parameter resolution
//! - `orchestrator`: the chain execution engine
//! - `batch`: fire-and-forget fan-out on top of the engine
//! - `router`: classification, dispatch, and health-driven failover

pub mod batch;
pub mod bus;
pub mod orchestrator;
pub mod registry;
pub mod router;
pub mod subscriptions;
pub mod template;

pub use batch::{BatchRunner, BatchTaskSpec};
pub use bus::{EventBus, EventFilter, PublishOutcome};
pub use orchestrator::{ExecutionLimits, Orchestrator};
pub use registry::{ActionSpec, AgentDescriptor, Chain, Registry, RetryPolicy, Stage, Step};
pub use router::{
    BreakerState, ChainExecutor, CircuitBreaker, Complexity, HealthState, RouteRequest, Router,
    RouterConfig, RouterHealth, SyncReport,
};
pub use subscriptions::{ActionPattern, Subscription};
