use chrono::{DateTime, Utc};

/// Source of wall-clock time for the host side of the engine.
///
/// Orchestration logic never calls this directly; it receives time through the
/// recorded `read_clock` activity so replays observe the same instant.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// [`Clock`] backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
