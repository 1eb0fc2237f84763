//! The orchestration replay ledger.
//!
//! Every orchestration instance owns an append-only history. The engine replays
//! it on each run: a step whose key is already recorded returns the recorded
//! result instead of invoking its activity again.

use std::future::Future;

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::message::OrchestrationOutcome;
use crate::order::OrderId;

/// The fixed set of activities an orchestration can call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityName {
    /// Read the order document.
    Load,
    /// Check business rules on the loaded order.
    Validate,
    /// Price a single line item.
    PriceLine,
    /// Derive tax, discount and total from the subtotal.
    AggregateTaxDiscount,
    /// Write totals and `COMPLETED` to the order document.
    PersistResult,
    /// Emit the terminal outcome message.
    PublishOutcome,
    /// Produce a timestamp for the workflow.
    ReadClock,
}

impl std::fmt::Display for ActivityName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Load => "load",
            Self::Validate => "validate",
            Self::PriceLine => "price_line",
            Self::AggregateTaxDiscount => "aggregate_tax_discount",
            Self::PersistResult => "persist_result",
            Self::PublishOutcome => "publish_outcome",
            Self::ReadClock => "read_clock",
        };
        f.write_str(name)
    }
}

/// Identity of one step within an instance.
///
/// Sequential steps are keyed by activity alone; fan-out steps add the line
/// index so replay can match each parallel result to its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepKey {
    /// Activity invoked by the step.
    pub activity: ActivityName,
    /// Line index for fan-out steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

impl StepKey {
    /// Key for a sequential step.
    pub const fn single(activity: ActivityName) -> Self {
        Self {
            activity,
            index: None,
        }
    }

    /// Key for the `index`-th branch of a fan-out.
    pub const fn indexed(activity: ActivityName, index: usize) -> Self {
        Self {
            activity,
            index: Some(index),
        }
    }
}

impl std::fmt::Display for StepKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}[{index}]", self.activity),
            None => write!(f, "{}", self.activity),
        }
    }
}

/// SHA-256 fingerprint of a step's serialized input.
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    AsRef,
    Display,
    Serialize,
    Deserialize
))]
pub struct InputHash(String);

impl InputHash {
    /// Fingerprint the JSON encoding of `input`.
    pub fn of<T: Serialize + ?Sized>(input: &T) -> Result<Self, serde_json::Error> {
        let bytes = serde_json::to_vec(input)?;
        Ok(Self::new(format!("{:x}", Sha256::digest(&bytes))))
    }
}

/// Version of an instance history: the number of events it holds.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct HistoryVersion(usize);

impl HistoryVersion {
    /// Version of a history that has no events.
    pub fn initial() -> Self {
        Self::new(0)
    }

    /// The version after appending `count` events.
    #[must_use]
    pub fn advance(self, count: usize) -> Self {
        Self::new(self.into_inner() + count)
    }
}

/// One entry of the replay ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    /// The instance was created by dispatch.
    OrchestrationStarted {
        /// Host bookkeeping; never read by orchestration logic.
        recorded_at: DateTime<Utc>,
    },
    /// An activity finished and its result is now authoritative.
    StepCompleted {
        /// Which step.
        step: StepKey,
        /// Fingerprint of the input the step was invoked with.
        input_hash: InputHash,
        /// JSON encoded activity result.
        result: Value,
        /// Host bookkeeping; never read by orchestration logic.
        recorded_at: DateTime<Utc>,
    },
    /// The workflow returned. No further events follow.
    OrchestrationCompleted {
        /// Final outcome.
        outcome: OrchestrationOutcome,
        /// Host bookkeeping; never read by orchestration logic.
        recorded_at: DateTime<Utc>,
    },
}

impl HistoryEvent {
    /// When the host appended this event.
    pub fn recorded_at(&self) -> DateTime<Utc> {
        match self {
            Self::OrchestrationStarted { recorded_at }
            | Self::StepCompleted { recorded_at, .. }
            | Self::OrchestrationCompleted { recorded_at, .. } => *recorded_at,
        }
    }
}

/// The full ordered history of one instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceHistory {
    events: Vec<HistoryEvent>,
}

impl InstanceHistory {
    /// Wrap events in stored order.
    pub const fn new(events: Vec<HistoryEvent>) -> Self {
        Self { events }
    }

    /// Events in append order.
    pub fn events(&self) -> &[HistoryEvent] {
        &self.events
    }

    /// Take the events out.
    pub fn into_events(self) -> Vec<HistoryEvent> {
        self.events
    }

    /// Version to pass as the expected version of the next append.
    pub fn version(&self) -> HistoryVersion {
        HistoryVersion::new(self.events.len())
    }

    /// Whether dispatch ever started this instance.
    pub fn is_started(&self) -> bool {
        !self.events.is_empty()
    }

    /// The recorded outcome, if the instance reached a terminal state.
    pub fn outcome(&self) -> Option<&OrchestrationOutcome> {
        self.events.iter().rev().find_map(|event| match event {
            HistoryEvent::OrchestrationCompleted { outcome, .. } => Some(outcome),
            _ => None,
        })
    }

    /// Whether an outcome was recorded.
    pub fn is_terminal(&self) -> bool {
        self.outcome().is_some()
    }

    /// Completed steps in the order they were recorded.
    pub fn completed_steps(&self) -> impl Iterator<Item = (&StepKey, &InputHash, &Value)> {
        self.events.iter().filter_map(|event| match event {
            HistoryEvent::StepCompleted {
                step,
                input_hash,
                result,
                ..
            } => Some((step, input_hash, result)),
            _ => None,
        })
    }

    /// Orchestration status report for `instance_id`, `None` if never started.
    pub fn status(&self, instance_id: &OrderId) -> Option<InstanceStatus> {
        let first = self.events.first()?;
        let last = self.events.last()?;
        let outcome = self.outcome();

        Some(InstanceStatus {
            instance_id: instance_id.clone(),
            runtime_status: if outcome.is_some() {
                RuntimeStatus::Completed
            } else {
                RuntimeStatus::Running
            },
            created_time: first.recorded_at(),
            last_updated_time: last.recorded_at(),
            current_step: self.completed_steps().last().map(|(step, _, _)| *step),
            output: outcome.map(ToString::to_string),
        })
    }
}

/// Runtime status of an orchestration instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeStatus {
    /// Started and not yet terminal, possibly stalled awaiting redelivery.
    Running,
    /// The workflow returned an outcome.
    Completed,
}

/// Operator view of an orchestration instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    /// Instance id, equal to the order id.
    pub instance_id: OrderId,
    /// Running or completed.
    pub runtime_status: RuntimeStatus,
    /// When the instance was started.
    pub created_time: DateTime<Utc>,
    /// When the last history event was appended.
    pub last_updated_time: DateTime<Utc>,
    /// Last completed step.
    pub current_step: Option<StepKey>,
    /// Outcome text once completed.
    pub output: Option<String>,
}

/// Trait defining the contract for orchestration history storage.
///
/// Appends carry the version the writer last observed. If the stored history
/// has moved on, the append fails with [`HistoryError::VersionConflict`] and
/// nothing is written, which keeps two runners of the same instance from
/// interleaving their ledgers.
pub trait HistoryStore: Send + Sync {
    /// Read every event of an instance. Unknown instances yield an empty history.
    fn read_history(
        &self,
        instance_id: &OrderId,
    ) -> impl Future<Output = Result<InstanceHistory, HistoryError>> + Send;

    /// Atomically append `events` if the history is still at `expected`.
    fn append_history(
        &self,
        instance_id: &OrderId,
        expected: HistoryVersion,
        events: Vec<HistoryEvent>,
    ) -> impl Future<Output = Result<HistoryVersion, HistoryError>> + Send;
}

/// Error type returned by history store operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HistoryError {
    /// The backend failed. Retrying may succeed.
    #[error("history store unavailable: {detail}")]
    Unavailable {
        /// Backend specific detail.
        detail: String,
    },

    /// Another writer appended to the instance first.
    #[error("history of {instance_id} is at version {actual}, expected {expected}")]
    VersionConflict {
        /// Instance being appended to.
        instance_id: OrderId,
        /// Version the writer observed.
        expected: HistoryVersion,
        /// Version actually stored.
        actual: HistoryVersion,
    },

    /// A history event could not be encoded or decoded.
    #[error("history of {instance_id} is unreadable: {detail}")]
    Corrupted {
        /// Instance whose history failed to decode.
        instance_id: OrderId,
        /// Codec message.
        detail: String,
    },
}

impl HistoryError {
    /// Build an [`HistoryError::Unavailable`] from any displayable cause.
    pub fn unavailable(detail: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            detail: detail.to_string(),
        }
    }

    /// Whether retrying the operation may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}
