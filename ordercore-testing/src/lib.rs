#![forbid(unsafe_code)]
#![deny(
    bad_style,
    deprecated,
    meta_variable_misuse,
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

//! Testing utilities for ordercore: fault-injecting wrappers around the
//! capability traits, shared fixtures, and contract suites every backend runs.

pub mod chaos;
pub mod contract;
pub mod fixtures;

pub use chaos::*;
pub use fixtures::FixedClock;
