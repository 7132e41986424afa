//! Domain data structures.
//!
//! - `event`: Event Bus records and the human-response lifecycle
//! - `run`: chain executions and per-step results
//! - `batch`: fire-and-forget fan-out batches

pub mod batch;
pub mod event;
pub mod run;

pub use batch::{Batch, BatchTask, TaskStatus};
pub use event::{Event, EventStatus, HumanInteraction, PendingHumanEvent};
pub use run::{ChainRun, RunStatus, StepResult, StepStatus};
