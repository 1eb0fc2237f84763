use std::sync::Arc;

use ordercore_types::{OrderId, OutcomeMessage, QueueError, QueueName, WorkQueue};
use thiserror::Error;
use tracing::{info, instrument};

use crate::errors::ActivityError;

/// Errors raised while emitting an outcome message.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The outcome message could not be serialized.
    #[error("outcome for {order_id} could not be encoded: {detail}")]
    Encode { order_id: OrderId, detail: String },

    /// The processed queue rejected the message.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<PublishError> for ActivityError {
    fn from(error: PublishError) -> Self {
        match error {
            PublishError::Queue(queue) => queue.into(),
            encode @ PublishError::Encode { .. } => Self::Permanent(encode.to_string()),
        }
    }
}

/// Emits terminal outcomes on the processed queue.
///
/// Only the `publish_outcome` activity calls this, and the history records
/// that call, so an instance that already published never reaches it again.
pub struct ResultPublisher<Q> {
    queue: Arc<Q>,
    processed: QueueName,
}

impl<Q> Clone for ResultPublisher<Q> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            processed: self.processed.clone(),
        }
    }
}

impl<Q> ResultPublisher<Q>
where
    Q: WorkQueue,
{
    /// Create a publisher writing to the `processed` queue.
    pub const fn new(queue: Arc<Q>, processed: QueueName) -> Self {
        Self { queue, processed }
    }

    /// Queue outcomes are published to.
    pub const fn queue_name(&self) -> &QueueName {
        &self.processed
    }

    /// Publish one outcome message.
    ///
    /// # Errors
    ///
    /// [`PublishError`] if the message cannot be encoded or the queue rejects it.
    #[instrument(name = "publisher.publish", skip(self, message), fields(order_id = %message.order_id, status = %message.status))]
    pub async fn publish(&self, message: &OutcomeMessage) -> Result<(), PublishError> {
        let payload = serde_json::to_value(message).map_err(|error| PublishError::Encode {
            order_id: message.order_id.clone(),
            detail: error.to_string(),
        })?;

        self.queue.publish(&self.processed, &payload).await?;

        info!(queue = %self.processed, "[publisher.published] outcome emitted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordercore_memory::InMemoryWorkQueue;
    use ordercore_testing::fixtures;
    use ordercore_types::Totals;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn publishes_camel_case_outcome_to_processed_queue() {
        let queue = Arc::new(InMemoryWorkQueue::new());
        let processed = QueueName::try_new("orders-processed").unwrap();
        let publisher = ResultPublisher::new(Arc::clone(&queue), processed.clone());
        let totals = Totals {
            subtotal: dec!(25),
            tax: dec!(4.75),
            discount: dec!(0),
            total: dec!(29.75),
        };

        publisher
            .publish(&OutcomeMessage::completed(
                fixtures::order_id("ORD-1"),
                totals,
                fixtures::epoch(),
            ))
            .await
            .unwrap();

        let published = queue.published(&processed);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0]["orderId"], "ORD-1");
        assert_eq!(published[0]["processedAt"], "2024-05-01T12:00:00Z");
    }
}
