//! The Dispatch Listener: turns dispatch messages into orchestration runs.

use std::sync::Arc;

use ordercore_types::{DispatchMessage, HistoryStore, OrchestrationOutcome, OrderStore, WorkQueue};
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, instrument, warn};

use crate::engine::{Orchestrator, RunOutcome};
use crate::errors::DispatchError;
use crate::retry::{retry_with_backoff, RetryError, RetryPolicy};

/// What handling a dispatch message amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The message named no known order and was discarded.
    Dropped,
    /// The instance had already finished; nothing was written or published.
    AlreadyCompleted(OrchestrationOutcome),
    /// The instance ran to its outcome during this call.
    Completed(OrchestrationOutcome),
    /// Another task in this process owns the instance right now.
    InFlight,
}

/// Starts or resumes the orchestration instance of each dispatched order.
///
/// Handling the same message any number of times is safe. A finished instance
/// is reported and a started one resumes. The `PROCESSING` write happens inside
/// the orchestrator's claim on the instance, never here.
pub struct DispatchListener<S, Q, H> {
    orders: Arc<S>,
    orchestrator: Arc<Orchestrator<S, Q, H>>,
    retry: RetryPolicy,
}

impl<S, Q, H> DispatchListener<S, Q, H>
where
    S: OrderStore,
    Q: WorkQueue,
    H: HistoryStore,
{
    /// Create a listener reading orders from `orders`.
    pub fn new(orders: Arc<S>, orchestrator: Arc<Orchestrator<S, Q, H>>, retry: RetryPolicy) -> Self {
        Self {
            orders,
            orchestrator,
            retry,
        }
    }

    /// Decode a raw queue payload and handle it.
    ///
    /// A payload that is not a dispatch message is logged and dropped.
    ///
    /// # Errors
    ///
    /// See [`DispatchListener::on_dispatch_message`].
    pub async fn on_raw_message(&self, payload: &Value) -> Result<DispatchOutcome, DispatchError> {
        match DispatchMessage::deserialize(payload) {
            Ok(message) => self.on_dispatch_message(&message).await,
            Err(decode) => {
                error!(%payload, error = %decode, "[dispatch.drop] malformed dispatch message");
                Ok(DispatchOutcome::Dropped)
            }
        }
    }

    /// Handle one dispatch message.
    ///
    /// # Errors
    ///
    /// Any error means the message should be redelivered: store or history
    /// failures after retries, or a fatal orchestration error.
    #[instrument(name = "dispatch.message", skip(self, message), fields(order_id = %message.order_id))]
    pub async fn on_dispatch_message(
        &self,
        message: &DispatchMessage,
    ) -> Result<DispatchOutcome, DispatchError> {
        let order_id = &message.order_id;
        let orders = self.orders.as_ref();

        let stored = retry_with_backoff(&self.retry, "get", || orders.get(order_id))
            .await
            .map_err(RetryError::into_inner)?;
        if stored.is_none() {
            warn!("[dispatch.drop] order not found");
            return Ok(DispatchOutcome::Dropped);
        }

        let recorded = self.orchestrator.history(order_id).await?;
        if let Some(outcome) = recorded.outcome() {
            info!(%outcome, "[dispatch.duplicate] instance already completed");
            return Ok(DispatchOutcome::AlreadyCompleted(outcome.clone()));
        }

        Ok(match self.orchestrator.run(order_id).await? {
            RunOutcome::Completed(outcome) => DispatchOutcome::Completed(outcome),
            RunOutcome::InFlight => DispatchOutcome::InFlight,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MaxRetryAttempts;
    use crate::engine::Activities;
    use crate::publisher::ResultPublisher;
    use ordercore_memory::{InMemoryHistoryStore, InMemoryOrderStore, InMemoryWorkQueue};
    use ordercore_testing::{fixtures, FixedClock};
    use ordercore_types::{Clock, OrderStatus, QueueName};
    use serde_json::json;

    struct Harness {
        orders: Arc<InMemoryOrderStore>,
        queue: Arc<InMemoryWorkQueue>,
        listener: DispatchListener<InMemoryOrderStore, InMemoryWorkQueue, InMemoryHistoryStore>,
    }

    fn processed() -> QueueName {
        QueueName::try_new("orders-processed").unwrap()
    }

    fn harness() -> Harness {
        let orders = Arc::new(InMemoryOrderStore::new());
        let queue = Arc::new(InMemoryWorkQueue::new());
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::default());
        let retry = RetryPolicy::fast(MaxRetryAttempts::try_new(2).unwrap());
        let activities = Activities::new(
            Arc::clone(&orders),
            ResultPublisher::new(Arc::clone(&queue), processed()),
            Arc::clone(&clock),
        );
        let orchestrator = Arc::new(Orchestrator::new(
            activities,
            Arc::new(InMemoryHistoryStore::new()),
            Arc::clone(&clock),
            retry.clone(),
        ));
        let listener = DispatchListener::new(Arc::clone(&orders), orchestrator, retry);
        Harness {
            orders,
            queue,
            listener,
        }
    }

    #[tokio::test]
    async fn created_order_is_processed_to_completion() {
        let Harness {
            orders,
            queue,
            listener,
        } = harness();
        let order = fixtures::sample_order("ORD-1");
        orders.create_if_absent(&order).await.unwrap();

        let outcome = listener
            .on_dispatch_message(&DispatchMessage::new(order.order_id().clone()))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            DispatchOutcome::Completed(OrchestrationOutcome::Processed { .. })
        ));
        let stored = orders.get(order.order_id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), OrderStatus::Completed);
        assert_eq!(queue.published(&processed()).len(), 1);
    }

    #[tokio::test]
    async fn redelivery_after_completion_writes_and_publishes_nothing() {
        let Harness {
            orders,
            queue,
            listener,
        } = harness();
        let order = fixtures::sample_order("ORD-1");
        orders.create_if_absent(&order).await.unwrap();
        let message = DispatchMessage::new(order.order_id().clone());
        listener.on_dispatch_message(&message).await.unwrap();
        let writes = orders.write_count();

        let outcome = listener.on_dispatch_message(&message).await.unwrap();

        assert!(matches!(outcome, DispatchOutcome::AlreadyCompleted(_)));
        assert_eq!(orders.write_count(), writes);
        assert_eq!(queue.published(&processed()).len(), 1);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn unknown_order_is_dropped() {
        let Harness { listener, .. } = harness();

        let outcome = listener
            .on_dispatch_message(&DispatchMessage::new(fixtures::order_id("ghost")))
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Dropped);
        assert!(logs_contain("[dispatch.drop] order not found"));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn malformed_payload_is_logged_and_dropped() {
        let Harness { listener, queue, .. } = harness();

        let outcome = listener
            .on_raw_message(&json!({ "order": "ORD-1" }))
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Dropped);
        assert!(logs_contain("[dispatch.drop] malformed dispatch message"));
        assert!(queue.published(&processed()).is_empty());
    }
}
