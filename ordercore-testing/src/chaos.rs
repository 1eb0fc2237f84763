use std::collections::HashMap;
use std::future::Future;

use nutype::nutype;
use ordercore_types::{
    Delivery, Order, OrderId, OrderStore, QueueError, QueueName, StoreError, StoreOperation,
    WorkQueue,
};
use parking_lot::Mutex;
use rand::{random, rngs::StdRng, Rng, SeedableRng};
use serde_json::Value;

/// Chance in `[0.0, 1.0]` that a wrapped call fails.
///
/// ```ignore
/// use ordercore_testing::chaos::Probability;
///
/// assert!(Probability::try_new(0.25).is_ok());
/// assert!(Probability::try_new(1.5).is_err());
/// ```
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into)
)]
pub struct Probability(f32);

/// How often, and how reproducibly, a chaos wrapper fails calls.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    deterministic_seed: Option<u64>,
    failure_probability: Probability,
}

impl ChaosConfig {
    /// Seeded config with no random failures; only scripted ones fire.
    pub fn deterministic() -> Self {
        Self {
            deterministic_seed: Some(0),
            ..Self::default()
        }
    }

    /// Seed the random failures for a reproducible run.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.deterministic_seed = Some(seed);
        self
    }

    /// Fail each call with `probability`, clamped to `[0.0, 1.0]`.
    pub fn with_failure_probability(mut self, probability: f32) -> Self {
        self.failure_probability = Probability::try_new(probability.clamp(0.0, 1.0))
            .expect("clamped value is always valid");
        self
    }
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            failure_probability: Probability::try_new(0.0).expect("zero is a valid probability"),
        }
    }
}

struct Injector<K> {
    config: ChaosConfig,
    rng: Mutex<StdRng>,
    // Failures queued up front; consumed before any probabilistic draw
    scripted: Mutex<HashMap<K, u32>>,
}

impl<K> Injector<K>
where
    K: std::hash::Hash + Eq,
{
    fn new(config: ChaosConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.deterministic_seed.unwrap_or_else(random));

        Self {
            config,
            rng: Mutex::new(rng),
            scripted: Mutex::new(HashMap::new()),
        }
    }

    fn script(&self, key: K, count: u32) {
        *self.scripted.lock().entry(key).or_insert(0) += count;
    }

    fn should_inject(&self, key: &K) -> bool {
        let consumed_script = self
            .scripted
            .lock()
            .get_mut(key)
            .filter(|remaining| **remaining > 0)
            .map(|remaining| *remaining -= 1)
            .is_some();

        consumed_script || self.should_inject_random()
    }
}

impl<K> Injector<K> {
    fn should_inject_random(&self) -> bool {
        let chance = f64::from(f32::from(self.config.failure_probability));
        match chance {
            c if c <= 0.0 => false,
            c if c >= 1.0 => true,
            c => self.rng.lock().random_bool(c),
        }
    }
}

/// `store.with_chaos(config)` for any [`OrderStore`].
pub trait ChaosOrderStoreExt: Sized {
    fn with_chaos(self, config: ChaosConfig) -> ChaosOrderStore<Self>;
}

/// [`OrderStore`] wrapper that turns calls into [`StoreError::Unavailable`].
pub struct ChaosOrderStore<S> {
    store: S,
    injector: Injector<StoreOperation>,
}

impl<S> ChaosOrderStore<S> {
    /// Wrap `store`.
    pub fn new(store: S, config: ChaosConfig) -> Self {
        Self {
            store,
            injector: Injector::new(config),
        }
    }

    /// Fail the next `count` calls of `operation`.
    pub fn fail_next(&self, operation: StoreOperation, count: u32) {
        self.injector.script(operation, count);
    }

    /// The wrapped store, bypassing injection.
    pub fn inner(&self) -> &S {
        &self.store
    }
}

impl<S> OrderStore for ChaosOrderStore<S>
where
    S: OrderStore,
{
    fn create_if_absent(
        &self,
        order: &Order,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send {
        let should_fail = self.injector.should_inject(&StoreOperation::CreateIfAbsent);
        let store = &self.store;

        async move {
            if should_fail {
                return Err(StoreError::unavailable(
                    StoreOperation::CreateIfAbsent,
                    "chaos: injected failure",
                ));
            }

            store.create_if_absent(order).await
        }
    }

    fn get(
        &self,
        order_id: &OrderId,
    ) -> impl Future<Output = Result<Option<Order>, StoreError>> + Send {
        let should_fail = self.injector.should_inject(&StoreOperation::Get);
        let store = &self.store;

        async move {
            if should_fail {
                return Err(StoreError::unavailable(
                    StoreOperation::Get,
                    "chaos: injected failure",
                ));
            }

            store.get(order_id).await
        }
    }

    fn upsert(&self, order: &Order) -> impl Future<Output = Result<Order, StoreError>> + Send {
        let should_fail = self.injector.should_inject(&StoreOperation::Upsert);
        let store = &self.store;

        async move {
            if should_fail {
                return Err(StoreError::unavailable(
                    StoreOperation::Upsert,
                    "chaos: injected failure",
                ));
            }

            store.upsert(order).await
        }
    }

    fn replace_if_unchanged(
        &self,
        current: &Order,
        next: &Order,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send {
        let should_fail = self
            .injector
            .should_inject(&StoreOperation::ReplaceIfUnchanged);
        let store = &self.store;

        async move {
            if should_fail {
                return Err(StoreError::unavailable(
                    StoreOperation::ReplaceIfUnchanged,
                    "chaos: injected failure",
                ));
            }

            store.replace_if_unchanged(current, next).await
        }
    }
}

impl<S> ChaosOrderStoreExt for S
where
    S: OrderStore,
{
    fn with_chaos(self, config: ChaosConfig) -> ChaosOrderStore<Self> {
        ChaosOrderStore::new(self, config)
    }
}

/// `queue.with_chaos(config)` for any [`WorkQueue`].
pub trait ChaosWorkQueueExt: Sized {
    fn with_chaos(self, config: ChaosConfig) -> ChaosWorkQueue<Self>;
}

/// [`WorkQueue`] wrapper that fails publishes and receives.
///
/// Scripted failures are per queue and apply to `publish` only, which is how
/// tests simulate an outbound queue that is down. Probabilistic failures apply
/// to `publish` and `receive` on every queue.
pub struct ChaosWorkQueue<Q> {
    queue: Q,
    injector: Injector<QueueName>,
}

impl<Q> ChaosWorkQueue<Q> {
    /// Wrap `queue`.
    pub fn new(queue: Q, config: ChaosConfig) -> Self {
        Self {
            queue,
            injector: Injector::new(config),
        }
    }

    /// Fail the next `count` publishes to `queue`.
    pub fn fail_next_publishes(&self, queue: &QueueName, count: u32) {
        self.injector.script(queue.clone(), count);
    }

    /// The wrapped queue, bypassing injection.
    pub fn inner(&self) -> &Q {
        &self.queue
    }
}

impl<Q> WorkQueue for ChaosWorkQueue<Q>
where
    Q: WorkQueue,
{
    fn publish(
        &self,
        queue: &QueueName,
        payload: &Value,
    ) -> impl Future<Output = Result<(), QueueError>> + Send {
        let should_fail = self.injector.should_inject(queue);
        let inner = &self.queue;

        async move {
            if should_fail {
                return Err(QueueError::unavailable(queue, "chaos: injected failure"));
            }

            inner.publish(queue, payload).await
        }
    }

    fn receive(
        &self,
        queue: &QueueName,
    ) -> impl Future<Output = Result<Option<Delivery>, QueueError>> + Send {
        let should_fail = self.injector.should_inject_random();
        let inner = &self.queue;

        async move {
            if should_fail {
                return Err(QueueError::unavailable(queue, "chaos: injected failure"));
            }

            inner.receive(queue).await
        }
    }

    fn ack(&self, delivery: &Delivery) -> impl Future<Output = Result<(), QueueError>> + Send {
        self.queue.ack(delivery)
    }

    fn release(&self, delivery: &Delivery) -> impl Future<Output = Result<(), QueueError>> + Send {
        self.queue.release(delivery)
    }
}

impl<Q> ChaosWorkQueueExt for Q
where
    Q: WorkQueue,
{
    fn with_chaos(self, config: ChaosConfig) -> ChaosWorkQueue<Self> {
        ChaosWorkQueue::new(self, config)
    }
}
