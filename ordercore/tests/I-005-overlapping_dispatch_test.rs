use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ordercore::config::MaxRetryAttempts;
use ordercore::{
    DispatchError, DispatchOutcome, OrchestrationError, OrderCore, OrderCoreConfig, RetryPolicy,
};
use ordercore_memory::{InMemoryHistoryStore, InMemoryOrderStore, InMemoryWorkQueue};
use ordercore_testing::{fixtures, FixedClock};
use ordercore_types::{
    DispatchMessage, OrchestrationOutcome, Order, OrderId, OrderStatus, OrderStore, StoreError,
};
use rust_decimal_macros::dec;

/// Order store whose first compare-and-swap stalls before reaching the
/// shared documents, leaving a window for a second dispatch to overlap.
struct StallingStore {
    inner: InMemoryOrderStore,
    stall: Option<Duration>,
    armed: AtomicBool,
}

impl StallingStore {
    fn new(inner: InMemoryOrderStore, stall: Option<Duration>) -> Self {
        Self {
            inner,
            stall,
            armed: AtomicBool::new(true),
        }
    }
}

impl OrderStore for StallingStore {
    async fn create_if_absent(&self, order: &Order) -> Result<bool, StoreError> {
        self.inner.create_if_absent(order).await
    }

    async fn get(&self, order_id: &OrderId) -> Result<Option<Order>, StoreError> {
        self.inner.get(order_id).await
    }

    async fn upsert(&self, order: &Order) -> Result<Order, StoreError> {
        self.inner.upsert(order).await
    }

    async fn replace_if_unchanged(&self, current: &Order, next: &Order) -> Result<bool, StoreError> {
        if let Some(stall) = self.stall {
            if self.armed.swap(false, Ordering::SeqCst) {
                tokio::time::sleep(stall).await;
            }
        }
        self.inner.replace_if_unchanged(current, next).await
    }
}

type Core = OrderCore<StallingStore, InMemoryWorkQueue, InMemoryHistoryStore>;

struct Shared {
    orders: InMemoryOrderStore,
    queue: Arc<InMemoryWorkQueue>,
    history: Arc<InMemoryHistoryStore>,
    config: OrderCoreConfig,
}

impl Shared {
    fn new() -> Self {
        Self {
            orders: InMemoryOrderStore::new(),
            queue: Arc::new(InMemoryWorkQueue::new()),
            history: Arc::new(InMemoryHistoryStore::new()),
            config: OrderCoreConfig {
                retry: RetryPolicy::fast(MaxRetryAttempts::try_new(2).unwrap()),
                ..OrderCoreConfig::default()
            },
        }
    }

    /// A runner over the shared backends, as a separate process would be.
    fn runner(&self, stall: Option<Duration>) -> Core {
        OrderCore::new(
            &self.config,
            Arc::new(StallingStore::new(self.orders.clone(), stall)),
            Arc::clone(&self.queue),
            Arc::clone(&self.history),
            Arc::new(FixedClock::default()),
        )
    }

    async fn seed(&self, raw_id: &str) -> DispatchMessage {
        let order = fixtures::sample_order(raw_id);
        self.orders.create_if_absent(&order).await.unwrap();
        DispatchMessage::new(order.order_id().clone())
    }

    async fn stored(&self, raw_id: &str) -> Order {
        self.orders
            .get(&fixtures::order_id(raw_id))
            .await
            .unwrap()
            .unwrap()
    }
}

fn processed_total(outcome: &DispatchOutcome) -> Option<rust_decimal::Decimal> {
    match outcome {
        DispatchOutcome::Completed(OrchestrationOutcome::Processed { totals }) => {
            Some(totals.total)
        }
        _ => None,
    }
}

#[tokio::test]
async fn overlapping_duplicate_in_one_process_leaves_order_completed() {
    // Given: one runner whose PROCESSING write stalls
    let shared = Shared::new();
    let message = shared.seed("ORD-RACE").await;
    let core = shared.runner(Some(Duration::from_millis(200)));

    // When: the same message is handled twice, the second 20ms into the first
    let slow = core.listener().on_dispatch_message(&message);
    let late = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        core.listener().on_dispatch_message(&message).await
    };
    let (slow, late) = tokio::join!(slow, late);

    // Then: the first delivery finished the order, the second stood aside
    assert_eq!(processed_total(&slow.unwrap()), Some(dec!(29.75)));
    assert_eq!(late.unwrap(), DispatchOutcome::InFlight);

    let stored = shared.stored("ORD-RACE").await;
    assert_eq!(stored.status(), OrderStatus::Completed);
    assert_eq!(stored.totals().map(|totals| totals.total), Some(dec!(29.75)));
    assert_eq!(
        shared.queue.published(&shared.config.queues.processed).len(),
        1
    );
}

#[tokio::test]
async fn stale_runner_cannot_regress_an_order_another_runner_completed() {
    // Given: two runners over the same backends, the first one stalling
    let shared = Shared::new();
    let message = shared.seed("ORD-RACE").await;
    let stalled = shared.runner(Some(Duration::from_millis(200)));
    let fresh = shared.runner(None);

    // When: both handle the message, the fresh runner finishing while the
    // stalled one still holds a CREATED copy
    let slow = stalled.listener().on_dispatch_message(&message);
    let quick = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        fresh.listener().on_dispatch_message(&message).await
    };
    let (slow, quick) = tokio::join!(slow, quick);

    // Then: the fresh runner completed the order and the stalled one lost
    assert_eq!(processed_total(&quick.unwrap()), Some(dec!(29.75)));
    assert!(matches!(
        slow,
        Err(DispatchError::Orchestration(OrchestrationError::Contended(_)))
    ));

    // And: the document was never moved back to PROCESSING
    let stored = shared.stored("ORD-RACE").await;
    assert_eq!(stored.status(), OrderStatus::Completed);
    assert!(stored.totals().is_some());

    // And: a later redelivery sees the finished instance
    let again = stalled.listener().on_dispatch_message(&message).await.unwrap();
    assert!(matches!(again, DispatchOutcome::AlreadyCompleted(_)));
}
