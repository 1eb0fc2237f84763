//! Wiring of every component over one set of backends.

use std::sync::Arc;

use ordercore_types::{Clock, HistoryStore, OrderStore, WorkQueue};

use crate::config::OrderCoreConfig;
use crate::dispatch::DispatchListener;
use crate::engine::{Activities, Orchestrator};
use crate::intake::IntakeGuard;
use crate::publisher::ResultPublisher;
use crate::worker::DispatchWorker;

/// The assembled system: intake on one side, dispatch and the engine on the
/// other, sharing the same store, queue and history.
pub struct OrderCore<S, Q, H> {
    intake: Arc<IntakeGuard<S, Q, H>>,
    listener: Arc<DispatchListener<S, Q, H>>,
    worker: Arc<DispatchWorker<S, Q, H>>,
}

impl<S, Q, H> Clone for OrderCore<S, Q, H> {
    fn clone(&self) -> Self {
        Self {
            intake: Arc::clone(&self.intake),
            listener: Arc::clone(&self.listener),
            worker: Arc::clone(&self.worker),
        }
    }
}

impl<S, Q, H> OrderCore<S, Q, H>
where
    S: OrderStore + 'static,
    Q: WorkQueue + 'static,
    H: HistoryStore + 'static,
{
    /// Wire every component over the given backends.
    ///
    /// Intake and the dispatch listener share `orders`. `queue` carries both
    /// the dispatch and the outcome queues named in `config`.
    pub fn new(
        config: &OrderCoreConfig,
        orders: Arc<S>,
        queue: Arc<Q>,
        history: Arc<H>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let publisher = ResultPublisher::new(Arc::clone(&queue), config.queues.processed.clone());
        let activities = Activities::new(Arc::clone(&orders), publisher, Arc::clone(&clock));
        let orchestrator = Arc::new(Orchestrator::new(
            activities,
            Arc::clone(&history),
            Arc::clone(&clock),
            config.retry.clone(),
        ));

        let listener = Arc::new(DispatchListener::new(
            Arc::clone(&orders),
            orchestrator,
            config.retry.clone(),
        ));
        let worker = Arc::new(DispatchWorker::new(
            Arc::clone(&listener),
            Arc::clone(&queue),
            config.queues.to_process.clone(),
            config.worker,
        ));
        let intake = Arc::new(IntakeGuard::new(
            orders,
            queue,
            history,
            config.queues.to_process.clone(),
            clock,
            config.retry.clone(),
        ));

        Self {
            intake,
            listener,
            worker,
        }
    }

    /// Submission and status queries.
    pub fn intake(&self) -> &IntakeGuard<S, Q, H> {
        &self.intake
    }

    /// Handler for single dispatch messages, bypassing the worker loop.
    pub fn listener(&self) -> &DispatchListener<S, Q, H> {
        &self.listener
    }

    /// Shared handle to the worker, for spawning [`DispatchWorker::run`].
    pub fn worker(&self) -> Arc<DispatchWorker<S, Q, H>> {
        Arc::clone(&self.worker)
    }
}
