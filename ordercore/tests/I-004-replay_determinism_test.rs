use std::sync::Arc;

use ordercore::config::MaxRetryAttempts;
use ordercore::{
    DispatchError, DispatchOutcome, OrchestrationError, OrderCore, OrderCoreConfig, RetryPolicy,
};
use ordercore_memory::{InMemoryHistoryStore, InMemoryOrderStore, InMemoryWorkQueue};
use ordercore_testing::{fixtures, FixedClock};
use ordercore_types::{
    ActivityName, DispatchMessage, HistoryEvent, InputHash, LineItem, OrchestrationOutcome, Order,
    OrderStore, StepKey,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const ORDER: &str = "ORD-REPLAY";

struct System {
    core: OrderCore<InMemoryOrderStore, InMemoryWorkQueue, InMemoryHistoryStore>,
    orders: Arc<InMemoryOrderStore>,
    queue: Arc<InMemoryWorkQueue>,
    history: Arc<InMemoryHistoryStore>,
    config: OrderCoreConfig,
}

fn system() -> System {
    let config = OrderCoreConfig {
        retry: RetryPolicy::fast(MaxRetryAttempts::try_new(2).unwrap()),
        ..OrderCoreConfig::default()
    };
    let orders = Arc::new(InMemoryOrderStore::new());
    let queue = Arc::new(InMemoryWorkQueue::new());
    let history = Arc::new(InMemoryHistoryStore::new());
    let core = OrderCore::new(
        &config,
        Arc::clone(&orders),
        Arc::clone(&queue),
        Arc::clone(&history),
        Arc::new(FixedClock::default()),
    );
    System {
        core,
        orders,
        queue,
        history,
        config,
    }
}

impl System {
    async fn dispatch(&self) -> Result<DispatchOutcome, DispatchError> {
        self.core
            .listener()
            .on_dispatch_message(&DispatchMessage::new(fixtures::order_id(ORDER)))
            .await
    }

    fn published(&self) -> usize {
        self.queue.published(&self.config.queues.processed).len()
    }
}

/// A complete uninterrupted run.
struct Reference {
    outcome: OrchestrationOutcome,
    events: Vec<HistoryEvent>,
    final_document: Order,
}

async fn fresh_run(items: &[LineItem]) -> Reference {
    let system = system();
    system
        .orders
        .create_if_absent(&fixtures::order_with_items(ORDER, items.to_vec()))
        .await
        .unwrap();

    let DispatchOutcome::Completed(outcome) = system.dispatch().await.unwrap() else {
        panic!("fresh run did not complete");
    };

    Reference {
        outcome,
        events: system.history.events(&fixtures::order_id(ORDER)),
        final_document: system
            .orders
            .get(&fixtures::order_id(ORDER))
            .await
            .unwrap()
            .unwrap(),
    }
}

fn records(prefix: &[HistoryEvent], activity: ActivityName) -> bool {
    prefix.iter().any(|event| {
        matches!(event, HistoryEvent::StepCompleted { step, .. } if step.activity == activity)
    })
}

/// Resume a new system from the first `cut` events of `reference`.
async fn resume_from(reference: &Reference, items: &[LineItem], cut: usize) -> System {
    let prefix = &reference.events[..cut];
    let system = system();

    // The document reflects whichever side effects the prefix already recorded
    let document = if records(prefix, ActivityName::PersistResult)
        || records(prefix, ActivityName::PublishOutcome)
    {
        reference.final_document.clone()
    } else {
        fixtures::order_with_items(ORDER, items.to_vec())
            .begin_processing(fixtures::epoch())
            .unwrap()
    };
    system.orders.upsert(&document).await.unwrap();
    system
        .history
        .seed(&fixtures::order_id(ORDER), prefix.to_vec());

    system
}

async fn assert_every_prefix_converges(items: &[LineItem]) {
    let reference = fresh_run(items).await;

    // Prefixes always keep the start event and drop the terminal one
    for cut in 1..reference.events.len() {
        let resumed = resume_from(&reference, items, cut).await;
        let already_published = records(&reference.events[..cut], ActivityName::PublishOutcome);

        let outcome = resumed.dispatch().await.unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Completed(reference.outcome.clone()),
            "prefix of {cut} events"
        );
        assert_eq!(
            resumed.history.events(&fixtures::order_id(ORDER)),
            reference.events,
            "history after resuming from {cut} events"
        );
        assert_eq!(
            resumed.published(),
            usize::from(!already_published),
            "publishes after resuming from {cut} events"
        );
    }
}

#[tokio::test]
async fn successful_run_resumes_identically_from_every_prefix() {
    assert_every_prefix_converges(&fixtures::sample_items()).await;
}

#[tokio::test]
async fn failed_validation_resumes_identically_from_every_prefix() {
    assert_every_prefix_converges(&[
        LineItem::new("A", 1, dec!(3)),
        LineItem::new("B", 1, dec!(-1)),
    ])
    .await;
}

#[tokio::test]
async fn tampered_input_hash_is_rejected_as_non_deterministic() {
    // Given: a history whose recorded validate input does not match the order
    let reference = fresh_run(&fixtures::sample_items()).await;
    let mut tampered: Vec<HistoryEvent> = reference.events[..reference.events.len() - 1].to_vec();
    for event in &mut tampered {
        if let HistoryEvent::StepCompleted {
            step, input_hash, ..
        } = event
        {
            if *step == StepKey::single(ActivityName::Validate) {
                *input_hash = InputHash::new("0".repeat(64));
            }
        }
    }
    let resumed = system();
    resumed
        .orders
        .upsert(&reference.final_document)
        .await
        .unwrap();
    resumed
        .history
        .seed(&fixtures::order_id(ORDER), tampered.clone());

    // When: dispatch resumes the instance
    let result = resumed.dispatch().await;

    // Then: the instance stalls without touching anything
    assert!(matches!(
        result,
        Err(DispatchError::Orchestration(OrchestrationError::NonDeterministic { step, .. }))
            if step == StepKey::single(ActivityName::Validate)
    ));
    assert_eq!(
        resumed.history.events(&fixtures::order_id(ORDER)),
        tampered
    );
    assert_eq!(resumed.published(), 0);
}

fn line_items() -> impl Strategy<Value = Vec<LineItem>> {
    prop::collection::vec((0_i64..4, 0_i64..250_000), 0..6).prop_map(|lines| {
        lines
            .into_iter()
            .enumerate()
            .map(|(index, (qty, cents))| {
                LineItem::new(format!("SKU-{index}"), qty, Decimal::new(cents, 2))
            })
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn resuming_from_any_prefix_matches_a_fresh_run(
        items in line_items(),
        cut in any::<prop::sample::Index>(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        runtime.block_on(async {
            let reference = fresh_run(&items).await;
            let cut = 1 + cut.index(reference.events.len() - 1);
            let resumed = resume_from(&reference, &items, cut).await;

            let outcome = resumed.dispatch().await.unwrap();

            prop_assert_eq!(outcome, DispatchOutcome::Completed(reference.outcome.clone()));
            prop_assert_eq!(
                resumed.history.events(&fixtures::order_id(ORDER)),
                reference.events.clone()
            );
            Ok(())
        })?;
    }
}
