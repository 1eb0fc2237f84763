//! In-memory adapters for the ordercore workflow engine
//!
//! This crate provides in-memory implementations of the `OrderStore`,
//! `WorkQueue` and `HistoryStore` traits from `ordercore-types`, useful for
//! testing and development scenarios where persistence is not required.
//!
//! Every adapter is cheaply cloneable; clones share the same underlying state,
//! so a test can hand one clone to the engine and keep another for assertions.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

mod history_store;
mod order_store;
mod work_queue;

pub use history_store::InMemoryHistoryStore;
pub use order_store::InMemoryOrderStore;
pub use work_queue::InMemoryWorkQueue;
