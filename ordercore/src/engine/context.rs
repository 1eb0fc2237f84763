//! The replay context every workflow step goes through.

use std::collections::HashMap;
use std::future::Future;

use futures::future::join_all;
use ordercore_types::{
    ActivityName, Clock, HistoryEvent, HistoryStore, HistoryVersion, InputHash, InstanceHistory,
    OrchestrationOutcome, OrderId, StepKey,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::errors::{ActivityError, OrchestrationError};
use crate::retry::{retry_with_backoff, RetryError, RetryPolicy};

/// Where a running instance is in the order workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestrationState {
    /// Reading the order document.
    Loading,
    /// Checking the order against the business rules.
    Validating,
    /// Pricing lines in parallel.
    Pricing,
    /// Summing line subtotals into totals.
    Aggregating,
    /// Persisting the result and publishing the outcome.
    Finalizing,
    /// The order was processed.
    Completed,
    /// The order was rejected by validation or pricing.
    Failed,
}

struct RecordedStep {
    input_hash: InputHash,
    result: Value,
}

/// Mediates every activity call of one instance.
///
/// Before invoking an activity the context looks the step up in the replayed
/// history. A recorded step returns its recorded result; an unrecorded step is
/// invoked under the retry policy and its result appended before the workflow
/// continues. Orchestration logic therefore only ever observes values that are
/// durable.
pub struct OrchestrationContext<'a, H> {
    instance_id: OrderId,
    history: &'a H,
    clock: &'a dyn Clock,
    retry: &'a RetryPolicy,
    recorded: HashMap<StepKey, RecordedStep>,
    version: HistoryVersion,
    unreplayed: usize,
    state: OrchestrationState,
}

impl<'a, H> OrchestrationContext<'a, H>
where
    H: HistoryStore,
{
    /// Build a context over an already read (and started) history.
    pub fn new(
        instance_id: OrderId,
        replayed: &InstanceHistory,
        history: &'a H,
        clock: &'a dyn Clock,
        retry: &'a RetryPolicy,
    ) -> Self {
        let recorded: HashMap<StepKey, RecordedStep> = replayed
            .completed_steps()
            .map(|(step, input_hash, result)| {
                (
                    *step,
                    RecordedStep {
                        input_hash: input_hash.clone(),
                        result: result.clone(),
                    },
                )
            })
            .collect();

        Self {
            instance_id,
            history,
            clock,
            retry,
            unreplayed: recorded.len(),
            recorded,
            version: replayed.version(),
            state: OrchestrationState::Loading,
        }
    }

    /// Instance this context records history for.
    pub const fn instance_id(&self) -> &OrderId {
        &self.instance_id
    }

    /// Whether recorded steps remain that the workflow has not reached yet.
    pub const fn is_replaying(&self) -> bool {
        self.unreplayed > 0
    }

    /// Current position in the workflow.
    pub const fn state(&self) -> OrchestrationState {
        self.state
    }

    /// History version the next append is expected at.
    pub const fn version(&self) -> HistoryVersion {
        self.version
    }

    pub(crate) fn enter(&mut self, state: OrchestrationState) {
        debug!(
            order_id = %self.instance_id,
            from = ?self.state,
            to = ?state,
            replaying = self.is_replaying(),
            "[engine.state] transition"
        );
        self.state = state;
    }

    /// Run one sequential step.
    ///
    /// # Errors
    ///
    /// * [`OrchestrationError::NonDeterministic`] if the step is recorded with
    ///   a different input
    /// * [`OrchestrationError::ActivityFailed`] if the activity exhausts its
    ///   retries or fails permanently
    /// * [`OrchestrationError::Contended`] if another runner appended first
    pub async fn call_activity<I, O, F, Fut>(
        &mut self,
        step: StepKey,
        input: &I,
        activity: F,
    ) -> Result<O, OrchestrationError>
    where
        I: Serialize + ?Sized,
        O: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<O, ActivityError>>,
    {
        let input_hash = hash_input(step, input)?;

        if let Some(result) = self.replay(step, &input_hash)? {
            return Ok(result);
        }

        let retry = self.retry;
        let output = retry_with_backoff(retry, &step.to_string(), activity)
            .await
            .map_err(|error| activity_failed(step, error))?;

        self.record(vec![(step, input_hash, encode_result(step, &output)?)])
            .await?;
        info!(order_id = %self.instance_id, %step, "[engine.step] activity completed");

        Ok(output)
    }

    /// Run `activity` once per input, all in flight at the same time.
    ///
    /// Each branch is keyed by its index. Recorded branches replay; the rest
    /// are joined and their results appended in index order in a single write.
    /// Results are returned in input order.
    pub async fn fan_out<'i, I, O, F, Fut>(
        &mut self,
        activity: ActivityName,
        inputs: &'i [I],
        invoke: F,
    ) -> Result<Vec<O>, OrchestrationError>
    where
        I: Serialize,
        O: Serialize + DeserializeOwned,
        F: Fn(usize, &'i I) -> Fut,
        Fut: Future<Output = Result<O, ActivityError>>,
    {
        let mut results: Vec<Option<O>> = Vec::with_capacity(inputs.len());
        let mut pending = Vec::new();

        for (index, input) in inputs.iter().enumerate() {
            let step = StepKey::indexed(activity, index);
            let input_hash = hash_input(step, input)?;
            let replayed = self.replay(step, &input_hash)?;
            if replayed.is_none() {
                pending.push((index, step, input_hash));
            }
            results.push(replayed);
        }

        if pending.is_empty() {
            return Ok(results.into_iter().flatten().collect());
        }

        let retry = self.retry;
        let invoke = &invoke;
        let branches = pending.iter().map(|(index, step, _)| {
            let index = *index;
            let name = step.to_string();
            async move {
                retry_with_backoff(retry, &name, || invoke(index, &inputs[index])).await
            }
        });
        let outcomes = join_all(branches).await;

        let mut records = Vec::with_capacity(pending.len());
        let mut first_failure = None;
        for ((index, step, input_hash), outcome) in pending.into_iter().zip(outcomes) {
            match outcome {
                Ok(output) => {
                    records.push((step, input_hash, encode_result(step, &output)?));
                    results[index] = Some(output);
                }
                Err(error) => {
                    if first_failure.is_none() {
                        first_failure = Some(activity_failed(step, error));
                    }
                }
            }
        }

        let fresh = records.len();
        if fresh > 0 {
            self.record(records).await?;
        }
        if let Some(failure) = first_failure {
            return Err(failure);
        }

        info!(
            order_id = %self.instance_id,
            %activity,
            branches = inputs.len(),
            fresh,
            "[engine.fan_out] all branches completed"
        );
        Ok(results.into_iter().flatten().collect())
    }

    /// Append the terminal event.
    pub(crate) async fn complete(
        &mut self,
        outcome: &OrchestrationOutcome,
    ) -> Result<(), OrchestrationError> {
        let event = HistoryEvent::OrchestrationCompleted {
            outcome: outcome.clone(),
            recorded_at: self.clock.now(),
        };
        self.append(vec![event]).await?;
        self.enter(if outcome.is_success() {
            OrchestrationState::Completed
        } else {
            OrchestrationState::Failed
        });
        Ok(())
    }

    fn replay<O>(&mut self, step: StepKey, input_hash: &InputHash) -> Result<Option<O>, OrchestrationError>
    where
        O: DeserializeOwned,
    {
        let Some(recorded) = self.recorded.get(&step) else {
            return Ok(None);
        };

        if &recorded.input_hash != input_hash {
            return Err(OrchestrationError::NonDeterministic {
                instance_id: self.instance_id.clone(),
                step,
                recorded: recorded.input_hash.clone(),
                replayed: input_hash.clone(),
            });
        }

        let output = serde_json::from_value(recorded.result.clone()).map_err(|error| {
            OrchestrationError::Codec {
                step,
                detail: error.to_string(),
            }
        })?;
        self.unreplayed = self.unreplayed.saturating_sub(1);
        debug!(order_id = %self.instance_id, %step, "[engine.replay] returning recorded result");

        Ok(Some(output))
    }

    async fn record(
        &mut self,
        steps: Vec<(StepKey, InputHash, Value)>,
    ) -> Result<(), OrchestrationError> {
        let recorded_at = self.clock.now();
        let events = steps
            .iter()
            .map(|(step, input_hash, result)| HistoryEvent::StepCompleted {
                step: *step,
                input_hash: input_hash.clone(),
                result: result.clone(),
                recorded_at,
            })
            .collect();

        self.append(events).await?;

        for (step, input_hash, result) in steps {
            self.recorded
                .insert(step, RecordedStep { input_hash, result });
        }
        Ok(())
    }

    async fn append(&mut self, events: Vec<HistoryEvent>) -> Result<(), OrchestrationError> {
        let history = self.history;
        let instance_id = &self.instance_id;
        let expected = self.version;

        let version = retry_with_backoff(self.retry, "append_history", || {
            history.append_history(instance_id, expected, events.clone())
        })
        .await
        .map_err(RetryError::into_inner)?;

        self.version = version;
        Ok(())
    }
}

fn hash_input<I>(step: StepKey, input: &I) -> Result<InputHash, OrchestrationError>
where
    I: Serialize + ?Sized,
{
    InputHash::of(input).map_err(|error| OrchestrationError::Codec {
        step,
        detail: error.to_string(),
    })
}

fn encode_result<O: Serialize>(step: StepKey, output: &O) -> Result<Value, OrchestrationError> {
    serde_json::to_value(output).map_err(|error| OrchestrationError::Codec {
        step,
        detail: error.to_string(),
    })
}

fn activity_failed(step: StepKey, error: RetryError<ActivityError>) -> OrchestrationError {
    OrchestrationError::ActivityFailed {
        step,
        attempts: error.attempts(),
        source: error.into_inner(),
    }
}
