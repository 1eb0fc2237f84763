use std::collections::HashSet;
use std::sync::Arc;

use ordercore_types::{
    Clock, HistoryEvent, HistoryStore, InstanceHistory, OrchestrationOutcome, OrderId, OrderStore,
    WorkQueue,
};
use parking_lot::Mutex;
use tracing::{error, info, instrument};

use super::activities::Activities;
use super::context::OrchestrationContext;
use super::workflow;
use crate::errors::OrchestrationError;
use crate::retry::{retry_with_backoff, RetryError, RetryPolicy};

/// Result of asking the orchestrator to run an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The workflow returned (now or on an earlier run).
    Completed(OrchestrationOutcome),
    /// Another task in this process is already running the instance.
    InFlight,
}

/// Claim on an instance id, released on drop.
struct ActiveGuard {
    active: Arc<Mutex<HashSet<OrderId>>>,
    instance_id: OrderId,
}

impl ActiveGuard {
    fn claim(active: &Arc<Mutex<HashSet<OrderId>>>, instance_id: &OrderId) -> Option<Self> {
        if !active.lock().insert(instance_id.clone()) {
            return None;
        }
        Some(Self {
            active: Arc::clone(active),
            instance_id: instance_id.clone(),
        })
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.instance_id);
    }
}

/// Starts and resumes orchestration instances.
///
/// At most one run per instance is active in a process. Across processes the
/// history's expected-version check rejects the slower runner.
pub struct Orchestrator<S, Q, H> {
    activities: Activities<S, Q>,
    history: Arc<H>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    active: Arc<Mutex<HashSet<OrderId>>>,
}

impl<S, Q, H> Orchestrator<S, Q, H>
where
    S: OrderStore,
    Q: WorkQueue,
    H: HistoryStore,
{
    /// Create an orchestrator recording into `history`.
    pub fn new(
        activities: Activities<S, Q>,
        history: Arc<H>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            activities,
            history,
            clock,
            retry,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Read the full history of an instance.
    pub async fn history(&self, instance_id: &OrderId) -> Result<InstanceHistory, OrchestrationError> {
        let history = self.history.as_ref();
        retry_with_backoff(&self.retry, "read_history", || history.read_history(instance_id))
            .await
            .map_err(|error| RetryError::into_inner(error).into())
    }

    /// Start the instance if new, resume it if started, or return the recorded
    /// outcome if it already finished.
    ///
    /// A `CREATED` order is moved to `PROCESSING` while the claim is held and
    /// before the workflow runs.
    #[instrument(name = "orchestrator.run", skip(self), fields(order_id = %instance_id))]
    pub async fn run(&self, instance_id: &OrderId) -> Result<RunOutcome, OrchestrationError> {
        let Some(_guard) = ActiveGuard::claim(&self.active, instance_id) else {
            info!("[orchestrator.in_flight] instance already running in this process");
            return Ok(RunOutcome::InFlight);
        };

        let mut replayed = self.history(instance_id).await?;
        if let Some(outcome) = replayed.outcome() {
            return Ok(RunOutcome::Completed(outcome.clone()));
        }

        let activities = &self.activities;
        let moved = retry_with_backoff(&self.retry, "mark_processing", || {
            activities.mark_processing(instance_id)
        })
        .await
        .map_err(RetryError::into_inner)?;
        if moved {
            info!("[orchestrator.processing] order moved to PROCESSING");
        }

        if !replayed.is_started() {
            let started = vec![HistoryEvent::OrchestrationStarted {
                recorded_at: self.clock.now(),
            }];
            let history = self.history.as_ref();
            retry_with_backoff(&self.retry, "append_history", || {
                history.append_history(instance_id, replayed.version(), started.clone())
            })
            .await
            .map_err(RetryError::into_inner)?;
            replayed = InstanceHistory::new(started);
            info!("[orchestrator.started] instance created");
        } else {
            info!(
                recorded_events = replayed.events().len(),
                "[orchestrator.resumed] replaying recorded history"
            );
        }

        let mut ctx = OrchestrationContext::new(
            instance_id.clone(),
            &replayed,
            self.history.as_ref(),
            self.clock.as_ref(),
            &self.retry,
        );

        let outcome = match workflow::process_order(&mut ctx, &self.activities, instance_id).await {
            Ok(outcome) => outcome,
            Err(failure) => {
                error!(
                    error = %failure,
                    state = ?ctx.state(),
                    "[orchestrator.stalled] instance stopped; awaiting redelivery"
                );
                return Err(failure);
            }
        };
        ctx.complete(&outcome).await?;

        info!(%outcome, "[orchestrator.completed] instance finished");
        Ok(RunOutcome::Completed(outcome))
    }
}
