//! The order workflow.
//!
//! Pure orchestration logic: every value it acts on comes out of an activity
//! call routed through the [`OrchestrationContext`], so replaying the same
//! history always takes the same path.

use chrono::{DateTime, Utc};
use ordercore_types::{
    ActivityName, HistoryStore, OrchestrationOutcome, Order, OrderId, OrderStore, OutcomeMessage,
    StepKey, Totals, WorkQueue,
};

use super::activities::{Activities, LinePrice, PersistInput, Validation};
use super::context::{OrchestrationContext, OrchestrationState};
use crate::errors::OrchestrationError;
use crate::pricing;

const CLOCK_PURPOSE: &str = "processed_at";

/// Drive one order from load to a terminal outcome.
pub async fn process_order<S, Q, H>(
    ctx: &mut OrchestrationContext<'_, H>,
    activities: &Activities<S, Q>,
    order_id: &OrderId,
) -> Result<OrchestrationOutcome, OrchestrationError>
where
    S: OrderStore,
    Q: WorkQueue,
    H: HistoryStore,
{
    ctx.enter(OrchestrationState::Loading);
    let loaded: Option<Order> = ctx
        .call_activity(StepKey::single(ActivityName::Load), order_id, move || {
            activities.load(order_id)
        })
        .await?;
    let Some(order) = loaded else {
        return Ok(OrchestrationOutcome::NotFound {
            order_id: order_id.clone(),
        });
    };

    ctx.enter(OrchestrationState::Validating);
    let order_ref = &order;
    let validation: Validation = ctx
        .call_activity(
            StepKey::single(ActivityName::Validate),
            order_ref,
            move || async move { Ok(activities.validate(order_ref)) },
        )
        .await?;
    if let Validation::Invalid { reason } = validation {
        let outcome = OrchestrationOutcome::ValidationFailed {
            reason: reason.clone(),
        };
        return finish_failed(ctx, activities, order_id, reason, outcome).await;
    }

    ctx.enter(OrchestrationState::Pricing);
    let lines: Vec<LinePrice> = ctx
        .fan_out(ActivityName::PriceLine, order.items(), move |_, item| async move {
            Ok(activities.price_line(item))
        })
        .await?;

    let mut subtotals = Vec::with_capacity(lines.len());
    for line in lines {
        match line {
            LinePrice::Priced { subtotal } => subtotals.push(subtotal),
            LinePrice::Rejected { reason } => {
                let outcome = OrchestrationOutcome::PricingFailed {
                    reason: reason.clone(),
                };
                return finish_failed(ctx, activities, order_id, reason, outcome).await;
            }
        }
    }
    let Some(subtotal) = pricing::sum_subtotals(subtotals) else {
        let reason = "Order subtotal out of range".to_string();
        let outcome = OrchestrationOutcome::PricingFailed {
            reason: reason.clone(),
        };
        return finish_failed(ctx, activities, order_id, reason, outcome).await;
    };

    ctx.enter(OrchestrationState::Aggregating);
    let aggregated: Option<Totals> = ctx
        .call_activity(
            StepKey::single(ActivityName::AggregateTaxDiscount),
            &subtotal,
            move || async move { Ok(activities.aggregate_tax_discount(subtotal)) },
        )
        .await?;
    let Some(totals) = aggregated else {
        let reason = "Order total out of range".to_string();
        let outcome = OrchestrationOutcome::PricingFailed {
            reason: reason.clone(),
        };
        return finish_failed(ctx, activities, order_id, reason, outcome).await;
    };

    ctx.enter(OrchestrationState::Finalizing);
    let persist_input = PersistInput {
        order_id,
        totals: &totals,
    };
    ctx.call_activity(
        StepKey::single(ActivityName::PersistResult),
        &persist_input,
        move || activities.persist_result(order_id, totals),
    )
    .await?;

    let processed_at = read_clock(ctx, activities).await?;
    let message = OutcomeMessage::completed(order_id.clone(), totals, processed_at);
    publish(ctx, activities, &message).await?;

    Ok(OrchestrationOutcome::Processed { totals })
}

async fn finish_failed<S, Q, H>(
    ctx: &mut OrchestrationContext<'_, H>,
    activities: &Activities<S, Q>,
    order_id: &OrderId,
    reason: String,
    outcome: OrchestrationOutcome,
) -> Result<OrchestrationOutcome, OrchestrationError>
where
    S: OrderStore,
    Q: WorkQueue,
    H: HistoryStore,
{
    let processed_at = read_clock(ctx, activities).await?;
    let message = OutcomeMessage::failed(order_id.clone(), reason, processed_at);
    publish(ctx, activities, &message).await?;

    Ok(outcome)
}

async fn read_clock<S, Q, H>(
    ctx: &mut OrchestrationContext<'_, H>,
    activities: &Activities<S, Q>,
) -> Result<DateTime<Utc>, OrchestrationError>
where
    S: OrderStore,
    Q: WorkQueue,
    H: HistoryStore,
{
    ctx.call_activity(
        StepKey::single(ActivityName::ReadClock),
        CLOCK_PURPOSE,
        move || async move { Ok(activities.read_clock()) },
    )
    .await
}

async fn publish<S, Q, H>(
    ctx: &mut OrchestrationContext<'_, H>,
    activities: &Activities<S, Q>,
    message: &OutcomeMessage,
) -> Result<(), OrchestrationError>
where
    S: OrderStore,
    Q: WorkQueue,
    H: HistoryStore,
{
    ctx.call_activity(
        StepKey::single(ActivityName::PublishOutcome),
        message,
        move || activities.publish_outcome(message),
    )
    .await
}
