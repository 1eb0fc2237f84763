use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use ordercore_types::{Delivery, DeliveryId, QueueError, QueueName, WorkQueue};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

#[derive(Debug)]
struct Pending {
    payload: Value,
    attempt: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    visible: HashMap<QueueName, VecDeque<Pending>>,
    in_flight: HashMap<DeliveryId, Delivery>,
    // Every payload ever published, in publish order
    published: HashMap<QueueName, Vec<Value>>,
}

/// Thread-safe in-memory work queue with at-least-once delivery.
///
/// Received messages stay in flight until acknowledged. Released messages go
/// to the back of their queue and are handed out again with a higher attempt.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWorkQueue {
    state: Arc<Mutex<QueueState>>,
}

impl InMemoryWorkQueue {
    /// Create a new queue set with no messages.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every payload published to `queue`, including already consumed ones.
    pub fn published(&self, queue: &QueueName) -> Vec<Value> {
        self.state
            .lock()
            .published
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of messages currently visible on `queue`.
    pub fn pending_len(&self, queue: &QueueName) -> usize {
        self.state.lock().visible.get(queue).map_or(0, VecDeque::len)
    }

    /// Number of deliveries handed out and not yet acknowledged or released.
    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}

impl WorkQueue for InMemoryWorkQueue {
    fn publish(
        &self,
        queue: &QueueName,
        payload: &Value,
    ) -> impl Future<Output = Result<(), QueueError>> + Send {
        let mut state = self.state.lock();
        state
            .visible
            .entry(queue.clone())
            .or_default()
            .push_back(Pending {
                payload: payload.clone(),
                attempt: 0,
            });
        state
            .published
            .entry(queue.clone())
            .or_default()
            .push(payload.clone());

        std::future::ready(Ok(()))
    }

    fn receive(
        &self,
        queue: &QueueName,
    ) -> impl Future<Output = Result<Option<Delivery>, QueueError>> + Send {
        let mut state = self.state.lock();
        let next = state
            .visible
            .get_mut(queue)
            .and_then(VecDeque::pop_front)
            .map(|pending| Delivery {
                id: DeliveryId::generate(),
                queue: queue.clone(),
                payload: pending.payload,
                attempt: pending.attempt + 1,
            });

        if let Some(delivery) = &next {
            state.in_flight.insert(delivery.id, delivery.clone());
        }

        std::future::ready(Ok(next))
    }

    fn ack(&self, delivery: &Delivery) -> impl Future<Output = Result<(), QueueError>> + Send {
        let removed = self.state.lock().in_flight.remove(&delivery.id);

        std::future::ready(match removed {
            Some(_) => Ok(()),
            None => Err(QueueError::UnknownDelivery(delivery.id)),
        })
    }

    fn release(&self, delivery: &Delivery) -> impl Future<Output = Result<(), QueueError>> + Send {
        let mut state = self.state.lock();
        let result = match state.in_flight.remove(&delivery.id) {
            Some(released) => {
                debug!(
                    queue = %released.queue,
                    attempt = released.attempt,
                    "[memory.queue] delivery released for redelivery"
                );
                state
                    .visible
                    .entry(released.queue)
                    .or_default()
                    .push_back(Pending {
                        payload: released.payload,
                        attempt: released.attempt,
                    });
                Ok(())
            }
            None => Err(QueueError::UnknownDelivery(delivery.id)),
        };

        std::future::ready(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue() -> QueueName {
        QueueName::try_new("orders-to-process").unwrap()
    }

    #[tokio::test]
    async fn messages_are_received_in_publish_order() {
        let work = InMemoryWorkQueue::new();
        work.publish(&queue(), &json!({ "orderId": "A" })).await.unwrap();
        work.publish(&queue(), &json!({ "orderId": "B" })).await.unwrap();

        let first = work.receive(&queue()).await.unwrap().unwrap();
        let second = work.receive(&queue()).await.unwrap().unwrap();

        assert_eq!(first.payload["orderId"], "A");
        assert_eq!(second.payload["orderId"], "B");
        assert!(work.receive(&queue()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn released_delivery_is_redelivered_with_next_attempt() {
        let work = InMemoryWorkQueue::new();
        work.publish(&queue(), &json!({ "orderId": "A" })).await.unwrap();

        let first = work.receive(&queue()).await.unwrap().unwrap();
        work.release(&first).await.unwrap();
        let again = work.receive(&queue()).await.unwrap().unwrap();

        assert_eq!(first.attempt, 1);
        assert_eq!(again.attempt, 2);
        assert_ne!(first.id, again.id);
    }

    #[tokio::test]
    async fn ack_removes_delivery_and_rejects_second_ack() {
        let work = InMemoryWorkQueue::new();
        work.publish(&queue(), &json!({ "orderId": "A" })).await.unwrap();
        let delivery = work.receive(&queue()).await.unwrap().unwrap();

        work.ack(&delivery).await.unwrap();

        assert_eq!(work.in_flight_len(), 0);
        assert_eq!(
            work.ack(&delivery).await,
            Err(QueueError::UnknownDelivery(delivery.id))
        );
        assert_eq!(work.published(&queue()).len(), 1);
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let work = InMemoryWorkQueue::new();
        let other = QueueName::try_new("orders-processed").unwrap();
        work.publish(&other, &json!({ "status": "COMPLETED" }))
            .await
            .unwrap();

        assert!(work.receive(&queue()).await.unwrap().is_none());
        assert_eq!(work.pending_len(&other), 1);
    }
}
