//! Return item model: one returned quantity of one original order line.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Physical condition of a returned unit, as assessed at the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemCondition {
    Resellable,
    Damaged,
    Defective,
    Disposed,
}

impl ItemCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemCondition::Resellable => "resellable",
            ItemCondition::Damaged => "damaged",
            ItemCondition::Defective => "defective",
            ItemCondition::Disposed => "disposed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "resellable" => ItemCondition::Resellable,
            "damaged" => ItemCondition::Damaged,
            "defective" => ItemCondition::Defective,
            _ => ItemCondition::Disposed,
        }
    }
}

/// Inventory handling decision for a returned unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    ReturnToStock,
    Clearance,
    RmaVendor,
    Dispose,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::ReturnToStock => "return_to_stock",
            Disposition::Clearance => "clearance",
            Disposition::RmaVendor => "rma_vendor",
            Disposition::Dispose => "dispose",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "return_to_stock" => Some(Disposition::ReturnToStock),
            "clearance" => Some(Disposition::Clearance),
            "rma_vendor" => Some(Disposition::RmaVendor),
            "dispose" => Some(Disposition::Dispose),
            _ => None,
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Return item row. Unit price is copied from the original sale at creation,
/// never looked up live. `disposition` stays NULL until settlement.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ReturnItem {
    pub return_item_id: Uuid,
    pub return_id: Uuid,
    pub order_line_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price_cents: i64,
    pub refund_amount_cents: i64,
    pub reason_code: String,
    pub reason_notes: Option<String>,
    pub condition: String,
    pub disposition: Option<String>,
}

impl ReturnItem {
    pub fn parsed_condition(&self) -> ItemCondition {
        ItemCondition::from_string(&self.condition)
    }
}
