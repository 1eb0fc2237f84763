use chrono::{DateTime, Utc};
use nutype::nutype;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order identifier domain type.
///
/// OrderId correlates every artifact belonging to one order: the intake request,
/// the dispatch message, the orchestration instance and the stored document.
/// Uses nutype for validation ensuring all order IDs are:
/// - Non-empty (trimmed strings with at least 1 character)
/// - Within reasonable length (max 255 characters)
/// - Sanitized (leading/trailing whitespace removed)
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize,
        TryFrom
    )
)]
pub struct OrderId(String);

/// Customer identifier domain type.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize,
        TryFrom
    )
)]
pub struct CustomerId(String);

/// Lifecycle status of an order document.
///
/// Status only ever moves forward: `Created -> Processing -> {Completed | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Accepted by intake, not yet picked up by dispatch.
    Created,
    /// Dispatched; the orchestration owns the document.
    Processing,
    /// Priced and persisted. Totals are present.
    Completed,
    /// Rejected by validation or pricing.
    Failed,
}

impl OrderStatus {
    /// Returns true for `Completed` and `Failed`.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is a forward transition.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Processing)
                | (Self::Processing, Self::Completed | Self::Failed)
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Processing => write!(f, "PROCESSING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// One line of an order.
///
/// The stored form keeps raw values: `qty > 0` and `price >= 0` are checked at
/// intake and again by the validation activity, so a document written by some
/// other path must still be representable here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    /// Stock keeping unit.
    pub sku: String,
    /// Ordered quantity.
    pub qty: i64,
    /// Unit price.
    pub price: Decimal,
}

impl LineItem {
    /// Create a line item.
    pub fn new(sku: impl Into<String>, qty: i64, price: Decimal) -> Self {
        Self {
            sku: sku.into(),
            qty,
            price,
        }
    }

    /// Describe why this line is invalid, if it is.
    pub fn violation(&self) -> Option<String> {
        if self.qty <= 0 {
            return Some(format!("Invalid qty for SKU {}", self.sku));
        }
        if self.price < Decimal::ZERO {
            return Some(format!("Invalid price for SKU {}", self.sku));
        }
        None
    }
}

/// Computed money fields of a completed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    /// Sum of all line subtotals.
    pub subtotal: Decimal,
    /// Tax on the subtotal.
    pub tax: Decimal,
    /// Volume discount on the subtotal.
    pub discount: Decimal,
    /// `subtotal + tax - discount`.
    pub total: Decimal,
}

/// Error returned when an order status change would move backwards or skip a state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("order {order_id} cannot move from {from} to {to}")]
pub struct TransitionError {
    /// The order that rejected the transition.
    pub order_id: OrderId,
    /// Current status.
    pub from: OrderStatus,
    /// Requested status.
    pub to: OrderStatus,
}

/// The order document.
///
/// Fields are private; status changes go through [`Order::begin_processing`],
/// [`Order::complete`] and [`Order::fail`] so totals exist if and only if the
/// order is `COMPLETED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    order_id: OrderId,
    customer_id: CustomerId,
    items: Vec<LineItem>,
    #[serde(rename = "orderStatus")]
    status: OrderStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(flatten)]
    totals: Option<Totals>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    dispatch_pending: bool,
}

impl Order {
    /// Create a new order in `CREATED` status.
    pub fn new(
        order_id: OrderId,
        customer_id: CustomerId,
        items: Vec<LineItem>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            order_id,
            customer_id,
            items,
            status: OrderStatus::Created,
            created_at,
            updated_at: created_at,
            totals: None,
            dispatch_pending: false,
        }
    }

    /// Idempotency key of the order.
    pub fn order_id(&self) -> &OrderId {
        &self.order_id
    }

    /// Customer who placed the order.
    pub fn customer_id(&self) -> &CustomerId {
        &self.customer_id
    }

    /// Lines in submission order.
    pub fn items(&self) -> &[LineItem] {
        &self.items
    }

    /// Current lifecycle status.
    pub fn status(&self) -> OrderStatus {
        self.status
    }

    /// When intake accepted the order.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When the status last changed.
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Totals, present only once the order is `COMPLETED`.
    pub fn totals(&self) -> Option<&Totals> {
        self.totals.as_ref()
    }

    /// Whether the order was stored but its dispatch message was never sent.
    pub fn is_dispatch_pending(&self) -> bool {
        self.dispatch_pending
    }

    /// Set or clear the pending-dispatch mark. Only a `CREATED` order can carry
    /// it; for any other status the mark is cleared.
    #[must_use]
    pub fn with_dispatch_pending(mut self, pending: bool) -> Self {
        self.dispatch_pending = pending && self.status == OrderStatus::Created;
        self
    }

    /// Move a `CREATED` order to `PROCESSING`.
    pub fn begin_processing(self, at: DateTime<Utc>) -> Result<Self, TransitionError> {
        self.transition(OrderStatus::Processing, at)
    }

    /// Move a `PROCESSING` order to `COMPLETED` with its totals.
    ///
    /// Completing an order that is already `COMPLETED` with the same totals
    /// returns it unchanged.
    pub fn complete(self, totals: Totals, at: DateTime<Utc>) -> Result<Self, TransitionError> {
        if self.status == OrderStatus::Completed && self.totals == Some(totals) {
            return Ok(self);
        }
        let mut order = self.transition(OrderStatus::Completed, at)?;
        order.totals = Some(totals);
        Ok(order)
    }

    /// Move a `PROCESSING` order to `FAILED`. A `FAILED` order is returned unchanged.
    pub fn fail(self, at: DateTime<Utc>) -> Result<Self, TransitionError> {
        if self.status == OrderStatus::Failed {
            return Ok(self);
        }
        self.transition(OrderStatus::Failed, at)
    }

    /// Business status projection served to clients.
    pub fn status_view(&self) -> OrderStatusView {
        OrderStatusView {
            order_id: self.order_id.clone(),
            order_status: self.status,
            totals: match self.status {
                OrderStatus::Completed => self.totals,
                _ => None,
            },
        }
    }

    fn transition(mut self, to: OrderStatus, at: DateTime<Utc>) -> Result<Self, TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                order_id: self.order_id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = at;
        self.dispatch_pending = false;
        Ok(self)
    }
}

/// `{orderId, orderStatus, totals}` as returned by the status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusView {
    /// The order.
    pub order_id: OrderId,
    /// Current status.
    pub order_status: OrderStatus,
    /// `None` unless the order is `COMPLETED`.
    pub totals: Option<Totals>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn sample_order() -> Order {
        Order::new(
            OrderId::try_new("ORD-1").unwrap(),
            CustomerId::try_new("CUST-1").unwrap(),
            vec![LineItem::new("SKU-A", 2, dec!(10))],
            at(0),
        )
    }

    fn sample_totals() -> Totals {
        Totals {
            subtotal: dec!(20),
            tax: dec!(3.8),
            discount: dec!(0),
            total: dec!(23.8),
        }
    }

    #[test]
    fn new_order_starts_created_without_totals() {
        let order = sample_order();

        assert_eq!(order.status(), OrderStatus::Created);
        assert!(order.totals().is_none());
        assert_eq!(order.created_at(), order.updated_at());
    }

    #[test]
    fn order_id_rejects_blank_strings() {
        assert!(OrderId::try_new("   ").is_err());
    }

    #[test]
    fn order_id_trims_whitespace() {
        let id = OrderId::try_new("  ORD-7 ").unwrap();
        assert_eq!(id.as_ref(), "ORD-7");
    }

    #[test]
    fn completing_requires_processing_first() {
        let error = sample_order()
            .complete(sample_totals(), at(5))
            .unwrap_err();

        assert_eq!(error.from, OrderStatus::Created);
        assert_eq!(error.to, OrderStatus::Completed);
    }

    #[test]
    fn complete_sets_totals_and_updated_at() {
        let order = sample_order()
            .begin_processing(at(1))
            .and_then(|order| order.complete(sample_totals(), at(2)))
            .unwrap();

        assert_eq!(order.status(), OrderStatus::Completed);
        assert_eq!(order.totals(), Some(&sample_totals()));
        assert_eq!(order.updated_at(), at(2));
    }

    #[test]
    fn complete_is_idempotent_for_identical_totals() {
        let completed = sample_order()
            .begin_processing(at(1))
            .and_then(|order| order.complete(sample_totals(), at(2)))
            .unwrap();

        let again = completed.clone().complete(sample_totals(), at(9)).unwrap();

        assert_eq!(again, completed);
    }

    #[test]
    fn completed_order_cannot_fail() {
        let completed = sample_order()
            .begin_processing(at(1))
            .and_then(|order| order.complete(sample_totals(), at(2)))
            .unwrap();

        assert!(completed.fail(at(3)).is_err());
    }

    #[test]
    fn fail_is_idempotent() {
        let failed = sample_order()
            .begin_processing(at(1))
            .and_then(|order| order.fail(at(2)))
            .unwrap();

        assert_eq!(failed.clone().fail(at(3)).unwrap(), failed);
    }

    #[test]
    fn dispatch_mark_is_kept_only_while_created() {
        let pending = sample_order().with_dispatch_pending(true);
        assert!(pending.is_dispatch_pending());

        let processing = pending.begin_processing(at(1)).unwrap();
        assert!(!processing.is_dispatch_pending());
        assert!(!processing.with_dispatch_pending(true).is_dispatch_pending());
    }

    #[test]
    fn dispatch_mark_is_omitted_from_documents_when_clear() {
        let clear = serde_json::to_value(sample_order()).unwrap();
        let pending = serde_json::to_value(sample_order().with_dispatch_pending(true)).unwrap();

        assert!(clear.get("dispatchPending").is_none());
        assert_eq!(pending["dispatchPending"], true);
        assert!(serde_json::from_value::<Order>(pending)
            .unwrap()
            .is_dispatch_pending());
    }

    #[test]
    fn status_view_hides_totals_until_completed() {
        let processing = sample_order().begin_processing(at(1)).unwrap();
        assert!(processing.status_view().totals.is_none());

        let completed = processing.complete(sample_totals(), at(2)).unwrap();
        assert_eq!(completed.status_view().totals, Some(sample_totals()));
    }

    #[test]
    fn document_uses_camel_case_and_flattened_totals() {
        let completed = sample_order()
            .begin_processing(at(1))
            .and_then(|order| order.complete(sample_totals(), at(2)))
            .unwrap();

        let document = serde_json::to_value(&completed).unwrap();

        assert_eq!(document["orderId"], "ORD-1");
        assert_eq!(document["customerId"], "CUST-1");
        assert_eq!(document["orderStatus"], "COMPLETED");
        assert!(document.get("subtotal").is_some());
        assert!(document.get("totals").is_none());
    }

    #[test]
    fn document_without_totals_round_trips() {
        let order = sample_order();
        let document = serde_json::to_value(&order).unwrap();

        assert!(document.get("subtotal").is_none());
        let decoded: Order = serde_json::from_value(document).unwrap();
        assert_eq!(decoded, order);
    }

    #[test]
    fn line_violation_reports_sku() {
        let zero_qty = LineItem::new("SKU-Z", 0, dec!(1));
        let negative_price = LineItem::new("SKU-N", 1, dec!(-0.01));

        assert_eq!(
            zero_qty.violation().as_deref(),
            Some("Invalid qty for SKU SKU-Z")
        );
        assert_eq!(
            negative_price.violation().as_deref(),
            Some("Invalid price for SKU SKU-N")
        );
        assert!(LineItem::new("SKU-F", 1, dec!(0)).violation().is_none());
    }

    proptest! {
        #[test]
        fn status_never_regresses(from in 0usize..4, to in 0usize..4) {
            let all = [
                OrderStatus::Created,
                OrderStatus::Processing,
                OrderStatus::Completed,
                OrderStatus::Failed,
            ];
            let (from, to) = (all[from], all[to]);
            if from.can_transition_to(to) {
                prop_assert!(to as usize > from as usize);
                prop_assert!(!from.is_terminal());
            }
        }
    }
}
