//! Activity executors: the only code in the engine that touches the outside
//! world.
//!
//! Each activity is safe to run more than once with the same input. The
//! orchestration context records results, so in practice an activity runs
//! again only when a previous attempt failed or its result was never recorded.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ordercore_types::{
    Clock, LineItem, Order, OrderId, OrderStatus, OrderStore, OutcomeMessage, StoreError, Totals,
    WorkQueue,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::errors::ActivityError;
use crate::pricing;
use crate::publisher::ResultPublisher;

/// Result of the validate activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Validation {
    /// Every rule holds.
    Valid,
    /// The order is rejected.
    Invalid {
        /// First rule the order broke.
        reason: String,
    },
}

/// Result of pricing one line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinePrice {
    /// `qty x price` of the line.
    Priced { subtotal: Decimal },
    /// The line cannot be priced.
    Rejected { reason: String },
}

/// Input of the persist activity, recorded by fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistInput<'a> {
    /// Order to complete.
    pub order_id: &'a OrderId,
    /// Totals to store on it.
    pub totals: &'a Totals,
}

/// The activity set bound to concrete backends.
pub struct Activities<S, Q> {
    orders: Arc<S>,
    publisher: ResultPublisher<Q>,
    clock: Arc<dyn Clock>,
}

impl<S, Q> Clone for Activities<S, Q> {
    fn clone(&self) -> Self {
        Self {
            orders: Arc::clone(&self.orders),
            publisher: self.publisher.clone(),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S, Q> Activities<S, Q>
where
    S: OrderStore,
    Q: WorkQueue,
{
    /// Bind the activities to an order store and an outcome publisher.
    pub fn new(orders: Arc<S>, publisher: ResultPublisher<Q>, clock: Arc<dyn Clock>) -> Self {
        Self {
            orders,
            publisher,
            clock,
        }
    }

    /// Read the order document.
    #[instrument(name = "activity.load", skip(self))]
    pub async fn load(&self, order_id: &OrderId) -> Result<Option<Order>, ActivityError> {
        Ok(self.orders.get(order_id).await?)
    }

    /// Move a `CREATED` order to `PROCESSING`.
    ///
    /// The write is a compare-and-swap against the document just read, so a
    /// runner holding a stale copy can never overwrite a later status.
    /// Returns `true` only when this call made the move.
    #[instrument(name = "activity.mark_processing", skip(self))]
    pub async fn mark_processing(&self, order_id: &OrderId) -> Result<bool, StoreError> {
        let Some(created) = self
            .orders
            .get(order_id)
            .await?
            .filter(|order| order.status() == OrderStatus::Created)
        else {
            return Ok(false);
        };
        let Ok(processing) = created.clone().begin_processing(self.clock.now()) else {
            return Ok(false);
        };

        self.orders.replace_if_unchanged(&created, &processing).await
    }

    /// Check the business rules on a loaded order.
    pub fn validate(&self, order: &Order) -> Validation {
        if order.items().is_empty() {
            return Validation::Invalid {
                reason: "Items list is empty.".to_string(),
            };
        }

        order
            .items()
            .iter()
            .find_map(LineItem::violation)
            .map_or(Validation::Valid, |reason| Validation::Invalid { reason })
    }

    /// `qty x price` for one line.
    pub fn price_line(&self, item: &LineItem) -> LinePrice {
        match pricing::line_subtotal(item) {
            Some(subtotal) => LinePrice::Priced { subtotal },
            None => LinePrice::Rejected {
                reason: format!("Line total out of range for SKU {}", item.sku),
            },
        }
    }

    /// Tax, discount and total for a subtotal. `None` when out of range.
    pub fn aggregate_tax_discount(&self, subtotal: Decimal) -> Option<Totals> {
        pricing::compute_totals(subtotal)
    }

    /// Timestamp for the workflow, recorded like any other result.
    pub fn read_clock(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Write totals and `COMPLETED`. Repeating with identical totals is a no-op
    /// at the document level.
    #[instrument(name = "activity.persist_result", skip(self, totals))]
    pub async fn persist_result(
        &self,
        order_id: &OrderId,
        totals: Totals,
    ) -> Result<(), ActivityError> {
        let order = self.require(order_id).await?;
        if order.status() == OrderStatus::Completed && order.totals() == Some(&totals) {
            return Ok(());
        }

        let completed = order.complete(totals, self.clock.now())?;
        self.orders.upsert(&completed).await?;

        info!(total = %totals.total, "[activity.persist_result] order completed");
        Ok(())
    }

    /// Emit the terminal message. A `FAILED` outcome first moves the order
    /// document to `FAILED`.
    #[instrument(name = "activity.publish_outcome", skip(self, message), fields(order_id = %message.order_id, status = %message.status))]
    pub async fn publish_outcome(&self, message: &OutcomeMessage) -> Result<(), ActivityError> {
        if message.status == OrderStatus::Failed {
            let order = self.require(&message.order_id).await?;
            if order.status() != OrderStatus::Failed {
                let failed = order.fail(self.clock.now())?;
                self.orders.upsert(&failed).await?;
                info!("[activity.publish_outcome] order marked failed");
            }
        }

        self.publisher.publish(message).await?;
        Ok(())
    }

    async fn require(&self, order_id: &OrderId) -> Result<Order, ActivityError> {
        self.orders
            .get(order_id)
            .await?
            .ok_or_else(|| ActivityError::Permanent(format!("order {order_id} disappeared")))
    }
}
