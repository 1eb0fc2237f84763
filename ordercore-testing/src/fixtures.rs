//! Shared test data.

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use parking_lot::Mutex;
use ordercore_types::{Clock, CustomerId, LineItem, Order, OrderId};
use rust_decimal::Decimal;
use serde_json::{json, Value};

/// Instant every fixture clock starts at: 2024-05-01T12:00:00Z.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
        .single()
        .expect("fixture epoch is a valid timestamp")
}

/// [`Clock`] that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    /// A clock stopped at `at`.
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(at) }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: TimeDelta) {
        *self.now.lock() += by;
    }
}

impl Default for FixedClock {
    fn default() -> Self {
        Self::new(epoch())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Parse a fixture order id.
pub fn order_id(raw: &str) -> OrderId {
    OrderId::try_new(raw).expect("fixture order id is valid")
}

pub fn customer_id(raw: &str) -> CustomerId {
    CustomerId::try_new(raw).expect("fixture customer id is valid")
}

/// Two lines pricing to a subtotal of 25: `2 x 10` and `1 x 5`.
pub fn sample_items() -> Vec<LineItem> {
    vec![
        LineItem::new("SKU-A", 2, Decimal::from(10)),
        LineItem::new("SKU-B", 1, Decimal::from(5)),
    ]
}

/// A `CREATED` order with [`sample_items`].
pub fn sample_order(raw_id: &str) -> Order {
    order_with_items(raw_id, sample_items())
}

/// A `CREATED` order with the given lines, bypassing intake validation.
pub fn order_with_items(raw_id: &str, items: Vec<LineItem>) -> Order {
    Order::new(order_id(raw_id), customer_id("CUST-1"), items, epoch())
}

/// Intake request body for an order with [`sample_items`].
pub fn sample_request_body(raw_id: &str) -> Value {
    json!({
        "orderId": raw_id,
        "customerId": "CUST-1",
        "items": [
            { "sku": "SKU-A", "qty": 2, "price": 10.0 },
            { "sku": "SKU-B", "qty": 1, "price": 5.0 }
        ]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordercore_types::OrderStatus;

    #[test]
    fn fixed_clock_only_moves_when_advanced() {
        let clock = FixedClock::default();
        let before = clock.now();

        clock.advance(TimeDelta::seconds(30));

        assert_eq!(clock.now() - before, TimeDelta::seconds(30));
    }

    #[test]
    fn fixed_clock_survives_a_panic_while_locked() {
        let clock = std::sync::Arc::new(FixedClock::default());

        let holder = std::sync::Arc::clone(&clock);
        let panicked = std::thread::spawn(move || {
            let _now = holder.now.lock();
            panic!("test thread gives up while holding the clock");
        })
        .join();

        assert!(panicked.is_err());
        assert_eq!(clock.now(), epoch());
        clock.advance(TimeDelta::seconds(1));
        assert_eq!(clock.now(), epoch() + TimeDelta::seconds(1));
    }

    #[test]
    fn sample_order_starts_created() {
        let order = sample_order("ORD-1");

        assert_eq!(order.status(), OrderStatus::Created);
        assert_eq!(order.items().len(), 2);
    }
}
