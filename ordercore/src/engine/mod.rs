//! The durable orchestration engine.
//!
//! An instance per order replays its recorded history through the
//! [`OrchestrationContext`], so a crash at any point resumes at the first
//! unrecorded step and no completed activity runs twice.

pub mod activities;
pub mod context;
pub mod orchestrator;
pub mod workflow;

pub use activities::{Activities, LinePrice, PersistInput, Validation};
pub use context::{OrchestrationContext, OrchestrationState};
pub use orchestrator::{Orchestrator, RunOutcome};
pub use workflow::process_order;
