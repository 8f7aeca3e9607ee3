//! Read shapes consumed from the order store. The returns core never mutates
//! these beyond appending refund payment entries and recomputing paid/due.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Post-sale order statuses eligible for returns.
const RETURNABLE_STATUSES: &[&str] = &["completed", "paid", "fulfilled", "delivered"];

/// Order header fields the returns core needs.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct OrderSummary {
    pub order_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub status: String,
    /// Combined tax rate across the order's applicable components (e.g. 0.13).
    pub tax_rate: Decimal,
    pub tax_exempt: bool,
    pub total_cents: i64,
}

impl OrderSummary {
    pub fn is_post_sale(&self) -> bool {
        RETURNABLE_STATUSES.contains(&self.status.as_str())
    }
}

/// One sold line of the original order.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct OrderLine {
    pub order_line_id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price_cents: i64,
}

/// Completed payment on the original order, a candidate for refund allocation.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PaymentInstrument {
    pub payment_id: Uuid,
    pub order_id: Uuid,
    pub method: String,
    pub amount_cents: i64,
    pub processor_ref: Option<String>,
}

impl PaymentInstrument {
    /// Card-like instruments require an external processor call to refund.
    pub fn is_card_like(&self) -> bool {
        matches!(self.method.as_str(), "card" | "credit_card" | "debit_card")
    }
}
