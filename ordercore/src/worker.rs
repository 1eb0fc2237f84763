//! The Dispatch Worker: hosts the Dispatch Listener on the to-process queue.

use std::sync::Arc;

use futures::future::join_all;
use ordercore_types::{Delivery, HistoryStore, OrderStore, QueueError, QueueName, WorkQueue};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::dispatch::{DispatchListener, DispatchOutcome};

/// Counts from one [`DispatchWorker::drain`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Deliveries handled (including drops) and removed from the queue.
    pub acknowledged: usize,
    /// Deliveries handed back for redelivery.
    pub released: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handled {
    Acknowledged,
    Released,
}

/// Polls the to-process queue and runs each delivery through the listener.
pub struct DispatchWorker<S, Q, H> {
    listener: Arc<DispatchListener<S, Q, H>>,
    queue: Arc<Q>,
    to_process: QueueName,
    config: WorkerConfig,
}

impl<S, Q, H> DispatchWorker<S, Q, H>
where
    S: OrderStore + 'static,
    Q: WorkQueue + 'static,
    H: HistoryStore + 'static,
{
    /// Create a worker draining `to_process` into `listener`.
    pub fn new(
        listener: Arc<DispatchListener<S, Q, H>>,
        queue: Arc<Q>,
        to_process: QueueName,
        config: WorkerConfig,
    ) -> Self {
        Self {
            listener,
            queue,
            to_process,
            config,
        }
    }

    /// Process deliveries until `shutdown` turns `true`, then wait for the
    /// deliveries already in flight.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let max_in_flight: usize = self.config.max_in_flight.into();
        let poll_interval = self.config.poll_interval.as_duration();
        let mut tasks = JoinSet::new();

        info!(queue = %self.to_process, max_in_flight, "[worker.start] dispatch worker running");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            while tasks.len() >= max_in_flight {
                tasks.join_next().await;
            }

            match self.queue.receive(&self.to_process).await {
                Ok(Some(delivery)) => {
                    let listener = Arc::clone(&self.listener);
                    let queue = Arc::clone(&self.queue);
                    tasks.spawn(async move { handle(&listener, queue.as_ref(), delivery).await });
                    continue;
                }
                Ok(None) => {}
                Err(receive) => {
                    warn!(error = %receive, "[worker.receive_failed] polling again later");
                }
            }

            tokio::select! {
                () = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let remaining = tasks.len();
        while tasks.join_next().await.is_some() {}
        info!(remaining, "[worker.stop] dispatch worker stopped");
    }

    /// Handle every message visible right now, concurrently, and return.
    ///
    /// Messages released during the pass are not picked up again until the
    /// next call.
    ///
    /// # Errors
    ///
    /// Returns the queue error if receiving fails.
    pub async fn drain(&self) -> Result<DrainSummary, QueueError> {
        let mut deliveries = Vec::new();
        while let Some(delivery) = self.queue.receive(&self.to_process).await? {
            deliveries.push(delivery);
        }

        let listener = self.listener.as_ref();
        let queue = self.queue.as_ref();
        let handled = join_all(
            deliveries
                .into_iter()
                .map(|delivery| handle(listener, queue, delivery)),
        )
        .await;

        let released = handled
            .iter()
            .filter(|result| **result == Handled::Released)
            .count();
        Ok(DrainSummary {
            acknowledged: handled.len() - released,
            released,
        })
    }
}

async fn handle<S, Q, H>(
    listener: &DispatchListener<S, Q, H>,
    queue: &Q,
    delivery: Delivery,
) -> Handled
where
    S: OrderStore,
    Q: WorkQueue,
    H: HistoryStore,
{
    match listener.on_raw_message(&delivery.payload).await {
        Ok(outcome) => {
            if let DispatchOutcome::Completed(ref result) = outcome {
                debug!(attempt = delivery.attempt, %result, "[worker.handled] delivery completed an instance");
            }
            if let Err(ack) = queue.ack(&delivery).await {
                warn!(delivery = %delivery.id, error = %ack, "[worker.ack_failed] delivery will be seen again");
            }
            Handled::Acknowledged
        }
        Err(failure) => {
            error!(
                delivery = %delivery.id,
                attempt = delivery.attempt,
                error = %failure,
                "[worker.release] dispatch failed; releasing for redelivery"
            );
            if let Err(release) = queue.release(&delivery).await {
                warn!(delivery = %delivery.id, error = %release, "[worker.release_failed] delivery stays in flight");
            }
            Handled::Released
        }
    }
}
