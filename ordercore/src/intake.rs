//! The Intake Guard: idempotent order submission and status queries.

use std::sync::Arc;

use ordercore_types::{
    Clock, CustomerId, DispatchMessage, HistoryStore, InstanceStatus, LineItem, Order, OrderId,
    OrderStatusView, OrderStore, QueueName, WorkQueue,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{error, info, instrument, warn};

use crate::errors::{IntakeError, Violation};
use crate::retry::{retry_with_backoff, RetryError, RetryPolicy};

/// Order submission as sent by clients.
///
/// Every field is optional at this level so a malformed request yields a full
/// list of violations instead of the first decode error.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    /// Client chosen id, the idempotency key.
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
    /// Requested lines, at least one.
    #[serde(default)]
    pub items: Option<Vec<LineItemRequest>>,
}

/// One requested line.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LineItemRequest {
    #[serde(default)]
    pub sku: Option<String>,
    /// Must be positive.
    #[serde(default)]
    pub qty: Option<i64>,
    /// Unit price, must not be negative.
    #[serde(default)]
    pub price: Option<Decimal>,
}

impl OrderRequest {
    /// Decode a JSON request body.
    ///
    /// # Errors
    ///
    /// [`IntakeError::InvalidRequest`] if the body is not a JSON object of the
    /// expected shape.
    pub fn from_slice(body: &[u8]) -> Result<Self, IntakeError> {
        serde_json::from_slice(body).map_err(|error| {
            IntakeError::InvalidRequest(vec![Violation::new(
                "body",
                format!("Invalid JSON payload: {error}"),
            )])
        })
    }

    /// Check every field and build a `CREATED` order.
    ///
    /// # Errors
    ///
    /// [`IntakeError::InvalidRequest`] listing every violation found.
    pub fn into_order(self, now: chrono::DateTime<chrono::Utc>) -> Result<Order, IntakeError> {
        let mut violations = Vec::new();

        let order_id = required(self.order_id.as_deref(), "orderId", &mut violations)
            .and_then(|raw| {
                OrderId::try_new(raw)
                    .map_err(|error| violations.push(Violation::new("orderId", error.to_string())))
                    .ok()
            });
        let customer_id = required(self.customer_id.as_deref(), "customerId", &mut violations)
            .and_then(|raw| {
                CustomerId::try_new(raw)
                    .map_err(|error| {
                        violations.push(Violation::new("customerId", error.to_string()));
                    })
                    .ok()
            });

        let requested = self.items.unwrap_or_default();
        if requested.is_empty() {
            violations.push(Violation::new("items", "Items list cannot be empty"));
        }

        let mut items = Vec::with_capacity(requested.len());
        for (index, item) in requested.into_iter().enumerate() {
            if let Some(line) = check_line(index, item, &mut violations) {
                items.push(line);
            }
        }

        match (order_id, customer_id) {
            (Some(order_id), Some(customer_id)) if violations.is_empty() => {
                Ok(Order::new(order_id, customer_id, items, now))
            }
            _ => Err(IntakeError::InvalidRequest(violations)),
        }
    }
}

fn required<'a>(
    value: Option<&'a str>,
    field: &str,
    violations: &mut Vec<Violation>,
) -> Option<&'a str> {
    match value.map(str::trim) {
        Some(raw) if !raw.is_empty() => Some(raw),
        _ => {
            violations.push(Violation::new(field, "Missing required field"));
            None
        }
    }
}

fn check_line(
    index: usize,
    item: LineItemRequest,
    violations: &mut Vec<Violation>,
) -> Option<LineItem> {
    let before = violations.len();
    let sku = required(item.sku.as_deref(), &format!("items[{index}].sku"), violations)
        .map(ToString::to_string);
    let label = sku.as_deref().unwrap_or("<missing>");

    let qty = item.qty.filter(|qty| *qty > 0);
    if qty.is_none() {
        violations.push(Violation::new(
            format!("items[{index}].qty"),
            format!("Invalid qty for SKU {label}"),
        ));
    }
    let price = item.price.filter(|price| *price >= Decimal::ZERO);
    if price.is_none() {
        violations.push(Violation::new(
            format!("items[{index}].price"),
            format!("Invalid price for SKU {label}"),
        ));
    }

    if violations.len() > before {
        return None;
    }
    Some(LineItem::new(sku?, qty?, price?))
}

/// Result of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// `true` if this call created the order, `false` if it already existed.
    pub accepted: bool,
    /// The stored order.
    pub order: Order,
}

/// Accepts orders exactly once per id and hands them to dispatch.
pub struct IntakeGuard<S, Q, H> {
    orders: Arc<S>,
    queue: Arc<Q>,
    history: Arc<H>,
    to_process: QueueName,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl<S, Q, H> IntakeGuard<S, Q, H>
where
    S: OrderStore,
    Q: WorkQueue,
    H: HistoryStore,
{
    /// Create a guard publishing dispatch messages to `to_process`.
    pub fn new(
        orders: Arc<S>,
        queue: Arc<Q>,
        history: Arc<H>,
        to_process: QueueName,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            orders,
            queue,
            history,
            to_process,
            clock,
            retry,
        }
    }

    /// Decode and submit a raw JSON body.
    ///
    /// # Errors
    ///
    /// See [`IntakeGuard::submit`].
    pub async fn submit_json(&self, body: &[u8]) -> Result<Submission, IntakeError> {
        self.submit(OrderRequest::from_slice(body)?).await
    }

    /// Create the order if it does not exist yet and publish its dispatch
    /// message. A repeated submission returns the stored order untouched,
    /// unless an earlier dispatch attempt failed, in which case it retries
    /// the dispatch.
    ///
    /// Orders are stored with a pending-dispatch mark. Whichever submission
    /// clears the mark publishes the message, so concurrent duplicates never
    /// dispatch twice.
    ///
    /// # Errors
    ///
    /// * [`IntakeError::InvalidRequest`] - nothing was stored or published
    /// * [`IntakeError::DispatchUnavailable`] - the order was stored but the
    ///   dispatch message could not be published
    /// * [`IntakeError::Store`] - the store failed after retries
    #[instrument(
        name = "intake.submit",
        skip(self, request),
        fields(order_id = request.order_id.as_deref().unwrap_or(""))
    )]
    pub async fn submit(&self, request: OrderRequest) -> Result<Submission, IntakeError> {
        let order = request
            .into_order(self.clock.now())?
            .with_dispatch_pending(true);

        let orders = self.orders.as_ref();
        let created = retry_with_backoff(&self.retry, "create_if_absent", || {
            orders.create_if_absent(&order)
        })
        .await
        .map_err(RetryError::into_inner)?;

        if created {
            let order = self.dispatch(order).await?;
            info!(queue = %self.to_process, "[intake.accepted] order created and dispatched");
            return Ok(Submission {
                accepted: true,
                order,
            });
        }

        let existing = self.fetch(order.order_id()).await?;
        if !existing.is_dispatch_pending() {
            info!(
                status = %existing.status(),
                "[intake.duplicate] order already exists; not dispatching again"
            );
            return Ok(Submission {
                accepted: false,
                order: existing,
            });
        }

        info!("[intake.redispatch] order exists but was never dispatched; retrying");
        let order = self.dispatch(existing).await?;
        Ok(Submission {
            accepted: false,
            order,
        })
    }

    /// Clear the pending-dispatch mark of `pending` and publish its dispatch
    /// message. Returns the order as stored afterwards.
    ///
    /// Losing the race for the mark means another submission publishes.
    async fn dispatch(&self, pending: Order) -> Result<Order, IntakeError> {
        let order_id = pending.order_id().clone();
        let claimed = pending.clone().with_dispatch_pending(false);

        let orders = self.orders.as_ref();
        let won = retry_with_backoff(&self.retry, "claim_dispatch", || {
            orders.replace_if_unchanged(&pending, &claimed)
        })
        .await
        .map_err(RetryError::into_inner)?;
        if !won {
            info!("[intake.dispatch_claimed] another submission is dispatching this order");
            return self.fetch(&order_id).await;
        }

        let payload = serde_json::to_value(DispatchMessage::new(order_id.clone()))?;
        let queue = self.queue.as_ref();
        let to_process = &self.to_process;
        let published = retry_with_backoff(&self.retry, "publish_dispatch", || {
            queue.publish(to_process, &payload)
        })
        .await;

        match published {
            Ok(()) => Ok(claimed),
            Err(failure) => {
                let source = failure.into_inner();
                error!(error = %source, "[intake.dispatch_unavailable] order stored but not dispatched");
                self.restore_mark(&claimed, &pending).await;
                Err(IntakeError::DispatchUnavailable { order_id, source })
            }
        }
    }

    /// Put the pending-dispatch mark back so a resubmission retries.
    async fn restore_mark(&self, claimed: &Order, pending: &Order) {
        let orders = self.orders.as_ref();
        match retry_with_backoff(&self.retry, "restore_dispatch_mark", || {
            orders.replace_if_unchanged(claimed, pending)
        })
        .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!("[intake.dispatch_mark] order changed since the claim; mark not restored");
            }
            Err(failure) => {
                error!(
                    error = %failure.into_inner(),
                    "[intake.dispatch_mark] could not restore the pending-dispatch mark"
                );
            }
        }
    }

    /// Business status of an order.
    ///
    /// # Errors
    ///
    /// [`IntakeError::NotFound`] for unknown ids.
    pub async fn order_status(&self, order_id: &OrderId) -> Result<OrderStatusView, IntakeError> {
        Ok(self.fetch(order_id).await?.status_view())
    }

    /// Runtime status of the order's orchestration instance.
    ///
    /// # Errors
    ///
    /// [`IntakeError::NotFound`] if no instance was ever started.
    pub async fn instance_status(&self, order_id: &OrderId) -> Result<InstanceStatus, IntakeError> {
        let history = self.history.as_ref();
        let recorded = retry_with_backoff(&self.retry, "read_history", || {
            history.read_history(order_id)
        })
        .await
        .map_err(RetryError::into_inner)?;

        recorded
            .status(order_id)
            .ok_or_else(|| IntakeError::NotFound(order_id.clone()))
    }

    async fn fetch(&self, order_id: &OrderId) -> Result<Order, IntakeError> {
        let orders = self.orders.as_ref();
        retry_with_backoff(&self.retry, "get", || orders.get(order_id))
            .await
            .map_err(RetryError::into_inner)?
            .ok_or_else(|| IntakeError::NotFound(order_id.clone()))
    }
}
