//! Error types for every layer of the engine.
//!
//! Business rejections (invalid lines, failed validation) are not errors once
//! an order has been accepted: they become an [`ordercore_types::OrchestrationOutcome`].
//! The types here cover client input, infrastructure failure and broken
//! replay invariants.

use ordercore_types::{
    HistoryError, InputHash, OrderId, QueueError, StepKey, StoreError, TransitionError,
};
use serde::Serialize;
use thiserror::Error;

/// One problem found in an intake request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    /// Offending field path, e.g. `items[1].qty`.
    pub field: String,
    /// Client-facing message.
    pub message: String,
}

impl Violation {
    /// Create a violation for `field`.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors surfaced by the Intake Guard.
#[derive(Debug, Error)]
pub enum IntakeError {
    /// The request is malformed. Nothing was stored or published.
    #[error("invalid order request: {}", join_violations(.0))]
    InvalidRequest(Vec<Violation>),

    /// No order with this id.
    #[error("order {0} not found")]
    NotFound(OrderId),

    /// The order was stored but its dispatch message could not be published.
    /// Resubmitting the same request retries the dispatch.
    #[error("order {order_id} was stored but dispatch is unavailable: {source}")]
    DispatchUnavailable {
        /// The created order.
        order_id: OrderId,
        /// Last publish failure.
        #[source]
        source: QueueError,
    },

    /// The order store failed after retries.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The history ledger failed after retries.
    #[error(transparent)]
    History(#[from] HistoryError),

    /// The dispatch message could not be encoded.
    #[error("dispatch message could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

impl IntakeError {
    /// Whether the client may retry the same request later.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::DispatchUnavailable { .. } => true,
            Self::Store(error) => error.is_transient(),
            Self::History(error) => error.is_transient(),
            Self::InvalidRequest(_) | Self::NotFound(_) | Self::Encode(_) => false,
        }
    }
}

/// Failure of a single activity attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActivityError {
    /// Infrastructure hiccup. Retried by the policy.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Retrying cannot help.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl From<StoreError> for ActivityError {
    fn from(error: StoreError) -> Self {
        if error.is_transient() {
            Self::Transient(error.to_string())
        } else {
            Self::Permanent(error.to_string())
        }
    }
}

impl From<QueueError> for ActivityError {
    fn from(error: QueueError) -> Self {
        if error.is_transient() {
            Self::Transient(error.to_string())
        } else {
            Self::Permanent(error.to_string())
        }
    }
}

impl From<TransitionError> for ActivityError {
    fn from(error: TransitionError) -> Self {
        Self::Permanent(error.to_string())
    }
}

/// Fatal orchestration errors. The instance stops without a terminal event
/// and resumes from its recorded history on the next dispatch.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// An activity exhausted its retry policy or failed permanently.
    #[error("step {step} failed after {attempts} attempt(s): {source}")]
    ActivityFailed {
        /// The failing step.
        step: StepKey,
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        #[source]
        source: ActivityError,
    },

    /// The replayed input of a step differs from the recorded one.
    #[error(
        "history of {instance_id} diverged at {step}: recorded input {recorded}, replayed input {replayed}"
    )]
    NonDeterministic {
        /// Affected instance.
        instance_id: OrderId,
        /// Step whose input changed.
        step: StepKey,
        /// Fingerprint stored in history.
        recorded: InputHash,
        /// Fingerprint computed during replay.
        replayed: InputHash,
    },

    /// Another runner appended to the history first.
    #[error("instance {0} was advanced by another runner")]
    Contended(OrderId),

    /// A step input or result could not be encoded or decoded.
    #[error("step {step} could not be recorded or replayed: {detail}")]
    Codec {
        /// Affected step.
        step: StepKey,
        /// Codec message.
        detail: String,
    },

    /// The history store failed after retries.
    #[error(transparent)]
    History(HistoryError),

    /// The order store failed after retries while moving the order to
    /// `PROCESSING`.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<HistoryError> for OrchestrationError {
    fn from(error: HistoryError) -> Self {
        match error {
            HistoryError::VersionConflict { instance_id, .. } => Self::Contended(instance_id),
            other => Self::History(other),
        }
    }
}

/// Errors surfaced by the Dispatch Listener. The delivery should be released
/// for redelivery.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The order could not be read after retries.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The history could not be read after retries.
    #[error(transparent)]
    History(#[from] HistoryError),

    /// The orchestration run failed; the instance resumes on redelivery.
    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),
}
