use std::future::Future;

use nutype::nutype;
use serde_json::Value;
use uuid::Uuid;

/// Name of a work queue.
///
/// Queue names are trimmed, non-empty and at most 63 characters, which keeps
/// them valid for both storage queues and database identifiers.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 63),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct QueueName(String);

/// Receipt handle for one delivery of a queued message.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    AsRef,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct DeliveryId(Uuid);

impl DeliveryId {
    /// Creates a new time-ordered delivery id.
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

/// A message handed to a consumer.
///
/// The consumer must [`WorkQueue::ack`] the delivery once it is handled or
/// [`WorkQueue::release`] it to make the message visible again.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Receipt handle.
    pub id: DeliveryId,
    /// Queue the message was received from.
    pub queue: QueueName,
    /// Message body.
    pub payload: Value,
    /// How many times this message has been handed out, starting at 1.
    pub attempt: u32,
}

/// Trait defining the contract for message queues.
///
/// Delivery is at-least-once: a message may be received more than once and in
/// any order relative to other messages. Consumers must be idempotent.
pub trait WorkQueue: Send + Sync {
    /// Append a message to the named queue.
    fn publish(
        &self,
        queue: &QueueName,
        payload: &Value,
    ) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Take the next visible message, or `None` if the queue is empty.
    fn receive(
        &self,
        queue: &QueueName,
    ) -> impl Future<Output = Result<Option<Delivery>, QueueError>> + Send;

    /// Permanently remove a handled message.
    fn ack(&self, delivery: &Delivery) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Return an unhandled message to the queue for redelivery.
    fn release(&self, delivery: &Delivery)
        -> impl Future<Output = Result<(), QueueError>> + Send;
}

/// Error type returned by queue operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The transport failed. Retrying may succeed.
    #[error("queue {queue} unavailable: {detail}")]
    Unavailable {
        /// Queue being accessed.
        queue: QueueName,
        /// Transport specific detail.
        detail: String,
    },

    /// The delivery was already acknowledged, released or never handed out.
    #[error("delivery {0} is not in flight")]
    UnknownDelivery(DeliveryId),
}

impl QueueError {
    /// Build an [`QueueError::Unavailable`] from any displayable cause.
    pub fn unavailable(queue: &QueueName, detail: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            queue: queue.clone(),
            detail: detail.to_string(),
        }
    }

    /// Whether retrying the operation may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}
