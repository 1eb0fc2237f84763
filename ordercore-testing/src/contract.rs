use std::fmt;
use std::sync::Arc;

use chrono::TimeDelta;
use ordercore_types::{
    HistoryError, HistoryEvent, HistoryStore, HistoryVersion, LineItem, Order, OrderId,
    OrderStatus, OrderStore, QueueError, QueueName, StoreError, Totals, WorkQueue,
};
use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

use crate::fixtures;

#[derive(Debug)]
/// A contract scenario that failed, with the scenario name and what went wrong.
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn backend_error(
        scenario: &'static str,
        operation: &'static str,
        error: impl fmt::Display,
    ) -> Self {
        Self::new(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }

    fn assertion(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self::new(scenario, detail)
    }
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

/// Result of one contract scenario.
pub type ContractTestResult = Result<(), ContractTestFailure>;

fn contract_order_id(scenario: &'static str, label: &str) -> Result<OrderId, ContractTestFailure> {
    // Include UUID for parallel test execution against shared database
    let raw = format!("contract-{scenario}-{label}-{}", Uuid::now_v7());

    OrderId::try_new(raw.clone()).map_err(|error| {
        ContractTestFailure::assertion(
            scenario,
            format!("unable to construct order id `{raw}`: {error}"),
        )
    })
}

fn contract_queue(scenario: &'static str) -> Result<QueueName, ContractTestFailure> {
    let raw = format!("contract-{}", Uuid::now_v7().simple());

    QueueName::try_new(raw.clone()).map_err(|error| {
        ContractTestFailure::assertion(
            scenario,
            format!("unable to construct queue name `{raw}`: {error}"),
        )
    })
}

fn contract_order(order_id: &OrderId) -> Order {
    Order::new(
        order_id.clone(),
        fixtures::customer_id("CUST-CONTRACT"),
        vec![
            LineItem::new("SKU-A", 2, Decimal::new(1050, 2)),
            LineItem::new("SKU-B", 1, Decimal::new(5, 0)),
        ],
        fixtures::epoch(),
    )
}

fn store_step<T>(
    scenario: &'static str,
    operation: &'static str,
    result: Result<T, StoreError>,
) -> Result<T, ContractTestFailure> {
    result.map_err(|error| ContractTestFailure::backend_error(scenario, operation, error))
}

/// A second create of the same id reports `false` and keeps the first document.
pub async fn test_create_if_absent_is_idempotent<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: OrderStore + 'static,
{
    const SCENARIO: &str = "create_if_absent_is_idempotent";

    let store = make_store();
    let order_id = contract_order_id(SCENARIO, "single")?;
    let original = contract_order(&order_id);

    let first = store_step(SCENARIO, "create_if_absent", store.create_if_absent(&original).await)?;

    let altered = original
        .clone()
        .begin_processing(fixtures::epoch())
        .and_then(|order| order.fail(fixtures::epoch()))
        .map_err(|error| ContractTestFailure::assertion(SCENARIO, error.to_string()))?;
    let second = store_step(SCENARIO, "create_if_absent", store.create_if_absent(&altered).await)?;

    if !first || second {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected (true, false) from two creates, observed ({first}, {second})"),
        ));
    }

    let stored = store_step(SCENARIO, "get", store.get(&order_id).await)?;

    if stored.as_ref() != Some(&original) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("second create overwrote the document: {stored:?}"),
        ));
    }

    Ok(())
}

/// Racing creates of one id produce exactly one winner.
pub async fn test_concurrent_creates_single_winner<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: OrderStore + 'static,
{
    const SCENARIO: &str = "concurrent_creates_single_winner";
    const CONTENDERS: usize = 8;

    let store = Arc::new(make_store());
    let order_id = contract_order_id(SCENARIO, "contended")?;

    let handles: Vec<_> = (0..CONTENDERS)
        .map(|_| {
            let store = Arc::clone(&store);
            let order = contract_order(&order_id);
            tokio::spawn(async move { store.create_if_absent(&order).await })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        let outcome = handle
            .await
            .map_err(|error| ContractTestFailure::assertion(SCENARIO, error.to_string()))?;
        if store_step(SCENARIO, "create_if_absent", outcome)? {
            winners += 1;
        }
    }

    if winners != 1 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected exactly one winning create, observed {winners}"),
        ));
    }

    Ok(())
}

/// Reading an unknown id yields `None`.
pub async fn test_missing_order_reads_none<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: OrderStore + 'static,
{
    const SCENARIO: &str = "missing_order_reads_none";

    let store = make_store();
    let order_id = contract_order_id(SCENARIO, "absent")?;

    let found = store_step(SCENARIO, "get", store.get(&order_id).await)?;

    if let Some(order) = found {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected no document, observed {order:?}"),
        ));
    }

    Ok(())
}

/// Upserted totals read back exactly.
pub async fn test_upsert_preserves_totals<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: OrderStore + 'static,
{
    const SCENARIO: &str = "upsert_preserves_totals";

    let store = make_store();
    let order_id = contract_order_id(SCENARIO, "completed")?;
    let created = contract_order(&order_id);
    let _ = store_step(SCENARIO, "create_if_absent", store.create_if_absent(&created).await)?;

    let totals = Totals {
        subtotal: Decimal::new(2600, 2),
        tax: Decimal::new(494, 2),
        discount: Decimal::ZERO,
        total: Decimal::new(3094, 2),
    };
    let completed = created
        .begin_processing(fixtures::epoch() + TimeDelta::seconds(1))
        .and_then(|order| order.complete(totals, fixtures::epoch() + TimeDelta::seconds(2)))
        .map_err(|error| ContractTestFailure::assertion(SCENARIO, error.to_string()))?;

    let _ = store_step(SCENARIO, "upsert", store.upsert(&completed).await)?;
    let stored = store_step(SCENARIO, "get", store.get(&order_id).await)?;

    match stored {
        Some(order)
            if order.status() == OrderStatus::Completed && order.totals() == Some(&totals) =>
        {
            Ok(())
        }
        other => Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected completed order with totals, observed {other:?}"),
        )),
    }
}

/// A compare-and-swap against an outdated document writes nothing.
pub async fn test_replace_if_unchanged_rejects_stale_documents<F, S>(
    make_store: F,
) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: OrderStore + 'static,
{
    const SCENARIO: &str = "replace_if_unchanged_rejects_stale_documents";

    let store = make_store();
    let order_id = contract_order_id(SCENARIO, "cas")?;
    let created = contract_order(&order_id);
    store_step(SCENARIO, "create_if_absent", store.create_if_absent(&created).await)?;

    // Another writer changes the document without changing its status
    let marked = created.clone().with_dispatch_pending(true);
    let marked_won = store_step(
        SCENARIO,
        "replace_if_unchanged",
        store.replace_if_unchanged(&created, &marked).await,
    )?;

    let processing = created
        .clone()
        .begin_processing(fixtures::epoch() + TimeDelta::seconds(1))
        .map_err(|error| ContractTestFailure::assertion(SCENARIO, error.to_string()))?;
    let stale_won = store_step(
        SCENARIO,
        "replace_if_unchanged",
        store.replace_if_unchanged(&created, &processing).await,
    )?;

    if !marked_won || stale_won {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected fresh replace to win and stale replace to lose, observed {marked_won} and {stale_won}"),
        ));
    }

    let stored = store_step(SCENARIO, "get", store.get(&order_id).await)?;
    match stored {
        Some(order) if order == marked => Ok(()),
        other => Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected the marked CREATED order to survive, observed {other:?}"),
        )),
    }
}

#[macro_export]
macro_rules! order_store_contract_tests {
    (suite = $suite:ident, make_store = $make_store:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use $crate::contract::{
                test_concurrent_creates_single_winner, test_create_if_absent_is_idempotent,
                test_missing_order_reads_none, test_replace_if_unchanged_rejects_stale_documents,
                test_upsert_preserves_totals,
            };

            #[tokio::test(flavor = "multi_thread")]
            async fn create_if_absent_is_idempotent_contract() {
                test_create_if_absent_is_idempotent($make_store)
                    .await
                    .expect("order store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn concurrent_creates_single_winner_contract() {
                test_concurrent_creates_single_winner($make_store)
                    .await
                    .expect("order store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn missing_order_reads_none_contract() {
                test_missing_order_reads_none($make_store)
                    .await
                    .expect("order store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn upsert_preserves_totals_contract() {
                test_upsert_preserves_totals($make_store)
                    .await
                    .expect("order store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn replace_if_unchanged_rejects_stale_documents_contract() {
                test_replace_if_unchanged_rejects_stale_documents($make_store)
                    .await
                    .expect("order store contract failed");
            }
        }
    };
}

pub use order_store_contract_tests;

fn history_step<T>(
    scenario: &'static str,
    operation: &'static str,
    result: Result<T, HistoryError>,
) -> Result<T, ContractTestFailure> {
    result.map_err(|error| ContractTestFailure::backend_error(scenario, operation, error))
}

fn contract_events() -> Vec<HistoryEvent> {
    vec![
        HistoryEvent::OrchestrationStarted {
            recorded_at: fixtures::epoch(),
        },
        HistoryEvent::StepCompleted {
            step: ordercore_types::StepKey::single(ordercore_types::ActivityName::Load),
            input_hash: ordercore_types::InputHash::new("0".repeat(64)),
            result: json!({ "found": true }),
            recorded_at: fixtures::epoch() + TimeDelta::seconds(1),
        },
    ]
}

/// Appended events read back in order.
pub async fn test_history_append_and_read<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: HistoryStore + 'static,
{
    const SCENARIO: &str = "history_append_and_read";

    let store = make_store();
    let instance_id = contract_order_id(SCENARIO, "instance")?;
    let events = contract_events();

    let version = history_step(
        SCENARIO,
        "append_history",
        store
            .append_history(&instance_id, HistoryVersion::initial(), events.clone())
            .await,
    )?;
    let history = history_step(SCENARIO, "read_history", store.read_history(&instance_id).await)?;

    if version != HistoryVersion::new(events.len()) || history.events() != events.as_slice() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected {events:?} at version {}, observed {history:?} at {version}", events.len()),
        ));
    }

    Ok(())
}

/// An append at a stale version is rejected.
pub async fn test_history_version_conflict<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: HistoryStore + 'static,
{
    const SCENARIO: &str = "history_version_conflict";

    let store = make_store();
    let instance_id = contract_order_id(SCENARIO, "instance")?;
    let events = contract_events();

    let _ = history_step(
        SCENARIO,
        "append_history",
        store
            .append_history(&instance_id, HistoryVersion::initial(), events.clone())
            .await,
    )?;

    let stale = store
        .append_history(&instance_id, HistoryVersion::initial(), events.clone())
        .await;

    match stale {
        Err(HistoryError::VersionConflict { .. }) => {}
        other => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("expected version conflict, observed {other:?}"),
            ))
        }
    }

    let history = history_step(SCENARIO, "read_history", store.read_history(&instance_id).await)?;

    if history.events().len() != events.len() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!(
                "conflicting append must write nothing; observed {} events",
                history.events().len()
            ),
        ));
    }

    Ok(())
}

#[macro_export]
macro_rules! history_store_contract_tests {
    (suite = $suite:ident, make_store = $make_store:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use $crate::contract::{test_history_append_and_read, test_history_version_conflict};

            #[tokio::test(flavor = "multi_thread")]
            async fn history_append_and_read_contract() {
                test_history_append_and_read($make_store)
                    .await
                    .expect("history store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn history_version_conflict_contract() {
                test_history_version_conflict($make_store)
                    .await
                    .expect("history store contract failed");
            }
        }
    };
}

pub use history_store_contract_tests;

fn queue_step<T>(
    scenario: &'static str,
    operation: &'static str,
    result: Result<T, QueueError>,
) -> Result<T, ContractTestFailure> {
    result.map_err(|error| ContractTestFailure::backend_error(scenario, operation, error))
}

/// A released delivery becomes visible again.
pub async fn test_queue_redelivers_released_messages<F, Q>(make_queue: F) -> ContractTestResult
where
    F: Fn() -> Q + Send + Sync + Clone + 'static,
    Q: WorkQueue + 'static,
{
    const SCENARIO: &str = "queue_redelivers_released_messages";

    let work = make_queue();
    let queue = contract_queue(SCENARIO)?;
    let payload = json!({ "orderId": "ORD-CONTRACT" });

    queue_step(SCENARIO, "publish", work.publish(&queue, &payload).await)?;

    let first = queue_step(SCENARIO, "receive", work.receive(&queue).await)?
        .ok_or_else(|| ContractTestFailure::assertion(SCENARIO, "published message not received"))?;
    let hidden = queue_step(SCENARIO, "receive", work.receive(&queue).await)?;
    if hidden.is_some() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "in-flight message was handed out twice",
        ));
    }

    queue_step(SCENARIO, "release", work.release(&first).await)?;
    let second = queue_step(SCENARIO, "receive", work.receive(&queue).await)?
        .ok_or_else(|| ContractTestFailure::assertion(SCENARIO, "released message not redelivered"))?;

    if second.payload != payload || second.attempt <= first.attempt {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("unexpected redelivery {second:?} after {first:?}"),
        ));
    }

    queue_step(SCENARIO, "ack", work.ack(&second).await)?;
    let drained = queue_step(SCENARIO, "receive", work.receive(&queue).await)?;
    if drained.is_some() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "acknowledged message was delivered again",
        ));
    }

    Ok(())
}

#[macro_export]
macro_rules! work_queue_contract_tests {
    (suite = $suite:ident, make_queue = $make_queue:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use $crate::contract::test_queue_redelivers_released_messages;

            #[tokio::test(flavor = "multi_thread")]
            async fn queue_redelivers_released_messages_contract() {
                test_queue_redelivers_released_messages($make_queue)
                    .await
                    .expect("work queue contract failed");
            }
        }
    };
}

pub use work_queue_contract_tests;
