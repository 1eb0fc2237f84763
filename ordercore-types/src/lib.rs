#![forbid(unsafe_code)]
#![deny(
    bad_style,
    deprecated,
    non_ascii_idents,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_code,
    unused_imports,
    unused_must_use,
    unused_mut,
    unused_parens,
    unused_variables
)]

//! Shared vocabulary types and traits for the ordercore workflow engine.
//!
//! This crate provides the foundational types that are shared between the main
//! `ordercore` crate and adapter implementations like `ordercore-memory` and
//! `ordercore-postgres`. Keeping them here lets adapters implement the capability
//! traits without depending on the engine itself.
//!
//! # Overview
//!
//! This crate contains:
//! - Domain types: `Order`, `LineItem`, `OrderId`, `CustomerId`, `OrderStatus`, `Totals`
//! - Capability traits: `OrderStore`, `WorkQueue`, `HistoryStore`, `Clock`
//! - Replay ledger: `HistoryEvent`, `InstanceHistory`, `StepKey`, `InputHash`
//! - Messages: `DispatchMessage`, `OutcomeMessage`, `OrchestrationOutcome`
//! - Errors: `StoreError`, `QueueError`, `HistoryError`, `TransitionError`

mod clock;
mod history;
mod message;
mod order;
mod queue;
mod store;

pub use clock::{Clock, SystemClock};
pub use history::{
    ActivityName, HistoryError, HistoryEvent, HistoryStore, HistoryVersion, InputHash,
    InstanceHistory, InstanceStatus, RuntimeStatus, StepKey,
};
pub use message::{DispatchMessage, OrchestrationOutcome, OutcomeMessage};
pub use order::{
    CustomerId, CustomerIdError, LineItem, Order, OrderId, OrderIdError, OrderStatus,
    OrderStatusView, Totals, TransitionError,
};
pub use queue::{Delivery, DeliveryId, QueueError, QueueName, QueueNameError, WorkQueue};
pub use store::{OrderStore, StoreError, StoreOperation};
