//! `ordercore` - durable order processing
//!
//! Orders enter through the [`IntakeGuard`], which stores each order id exactly
//! once and publishes a dispatch message. The [`DispatchWorker`] hands those
//! messages to the [`DispatchListener`], which starts or resumes the order's
//! orchestration instance. The engine drives the instance through load,
//! validation, a concurrent per-line pricing fan-out, aggregation,
//! persistence and publication, recording every step so that a crash at any
//! point resumes without repeating a completed side effect.
//!
//! Backends are supplied through the capability traits of `ordercore-types`:
//! `ordercore-memory` for tests and development, `ordercore-postgres` for
//! production.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod intake;
pub mod pricing;
pub mod publisher;
pub mod retry;
pub mod system;
pub mod worker;

pub use config::{ConfigError, OrderCoreConfig, QueueNames, WorkerConfig};
pub use dispatch::{DispatchListener, DispatchOutcome};
pub use engine::{Orchestrator, RunOutcome};
pub use errors::{ActivityError, DispatchError, IntakeError, OrchestrationError, Violation};
pub use intake::{IntakeGuard, LineItemRequest, OrderRequest, Submission};
pub use publisher::{PublishError, ResultPublisher};
pub use retry::{retry_with_backoff, RetryError, RetryPolicy};
pub use system::OrderCore;
pub use worker::{DispatchWorker, DrainSummary};

pub use ordercore_types as types;
