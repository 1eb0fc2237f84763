//! Pricing rules: line subtotals, tax and volume discount.
//!
//! All arithmetic is exact decimal and checked. `None` means the amount left
//! the representable range, which the engine treats as a pricing rejection.

use ordercore_types::{LineItem, Totals};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Tax applied to every subtotal.
pub const TAX_RATE: Decimal = dec!(0.19);

/// Discount applied to subtotals strictly above [`DISCOUNT_THRESHOLD`].
pub const DISCOUNT_RATE: Decimal = dec!(0.05);

/// Subtotal an order must exceed to earn the volume discount.
pub const DISCOUNT_THRESHOLD: Decimal = dec!(1000);

/// `qty x price` for one line.
pub fn line_subtotal(item: &LineItem) -> Option<Decimal> {
    Decimal::from(item.qty).checked_mul(item.price)
}

/// Sum of line subtotals in line order.
pub fn sum_subtotals<I>(subtotals: I) -> Option<Decimal>
where
    I: IntoIterator<Item = Decimal>,
{
    subtotals
        .into_iter()
        .try_fold(Decimal::ZERO, Decimal::checked_add)
}

/// Derive tax, discount and total from a subtotal.
pub fn compute_totals(subtotal: Decimal) -> Option<Totals> {
    let tax = subtotal.checked_mul(TAX_RATE)?;
    let discount = if subtotal > DISCOUNT_THRESHOLD {
        subtotal.checked_mul(DISCOUNT_RATE)?
    } else {
        Decimal::ZERO
    };
    let total = subtotal.checked_add(tax)?.checked_sub(discount)?;

    Some(Totals {
        subtotal,
        tax,
        discount,
        total,
    })
}
