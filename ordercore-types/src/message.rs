use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::order::{OrderId, OrderStatus, Totals};

/// Trigger placed on the to-process queue by intake.
///
/// Not authoritative state: the order document and the orchestration history
/// are. The same message may arrive several times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchMessage {
    /// Order to start or resume.
    pub order_id: OrderId,
}

impl DispatchMessage {
    /// Create a dispatch message for an order.
    pub const fn new(order_id: OrderId) -> Self {
        Self { order_id }
    }
}

/// Terminal result emitted on the processed queue for downstream consumers.
///
/// Amounts are rendered as JSON numbers; the optional fields are omitted when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeMessage {
    /// The order this outcome belongs to.
    pub order_id: OrderId,
    /// `COMPLETED` or `FAILED`.
    pub status: OrderStatus,
    /// Present when completed.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub subtotal: Option<Decimal>,
    /// Present when completed.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub tax: Option<Decimal>,
    /// Present when completed.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub discount: Option<Decimal>,
    /// Present when completed.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub total: Option<Decimal>,
    /// Present when failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Time the orchestration produced this outcome.
    pub processed_at: DateTime<Utc>,
}

impl OutcomeMessage {
    /// Outcome for a priced and persisted order.
    pub fn completed(order_id: OrderId, totals: Totals, processed_at: DateTime<Utc>) -> Self {
        Self {
            order_id,
            status: OrderStatus::Completed,
            subtotal: Some(totals.subtotal),
            tax: Some(totals.tax),
            discount: Some(totals.discount),
            total: Some(totals.total),
            error: None,
            processed_at,
        }
    }

    /// Outcome for an order rejected by validation or pricing.
    pub fn failed(order_id: OrderId, error: String, processed_at: DateTime<Utc>) -> Self {
        Self {
            order_id,
            status: OrderStatus::Failed,
            subtotal: None,
            tax: None,
            discount: None,
            total: None,
            error: Some(error),
            processed_at,
        }
    }
}

/// Final result of one orchestration instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrchestrationOutcome {
    /// The order document did not exist when the instance loaded it.
    NotFound {
        /// The missing order.
        order_id: OrderId,
    },
    /// The order failed business validation.
    ValidationFailed {
        /// First violation found.
        reason: String,
    },
    /// A line could not be priced.
    PricingFailed {
        /// Rejection reason of the first failing line.
        reason: String,
    },
    /// The order was priced, persisted and published.
    Processed {
        /// Persisted totals.
        totals: Totals,
    },
}

impl OrchestrationOutcome {
    /// Whether the order ended up `COMPLETED`.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Processed { .. })
    }
}

impl std::fmt::Display for OrchestrationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { order_id } => write!(f, "Order {order_id} not found."),
            Self::ValidationFailed { reason } => write!(f, "Order validation failed: {reason}"),
            Self::PricingFailed { reason } => write!(f, "Order pricing failed: {reason}"),
            Self::Processed { .. } => write!(f, "Order processed successfully."),
        }
    }
}
