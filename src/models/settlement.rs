//! Settlement inputs and outputs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Disposition, RefundMethod, Return, StoreCredit};

/// Caller input for settling an approved return.
#[derive(Debug, Clone)]
pub struct SettleRequest {
    pub processed_by: Uuid,
    pub restocking_fee_cents: i64,
    /// Overrides the method chosen at creation when present.
    pub method_override: Option<RefundMethod>,
    /// Per-item disposition overrides keyed by return item id; items without
    /// an entry get the disposition derived from their condition.
    pub disposition_overrides: HashMap<Uuid, Disposition>,
    /// Till session for the optional cash-drawer movement on cash refunds.
    pub till_session_id: Option<Uuid>,
}

impl SettleRequest {
    pub fn new(processed_by: Uuid) -> Self {
        Self {
            processed_by,
            restocking_fee_cents: 0,
            method_override: None,
            disposition_overrides: HashMap::new(),
            till_session_id: None,
        }
    }
}

/// One slice of the refund amount assigned to an original payment instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundAllocation {
    pub payment_id: Uuid,
    pub amount_cents: i64,
    /// Present when the allocation went through the external processor.
    pub processor_refund_id: Option<String>,
}

/// Store credit issued during settlement, either as the primary rail or as
/// overflow from the original-payment rail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreCreditGrant {
    pub credit: StoreCredit,
    pub amount_cents: i64,
}

/// Inventory ledger effect applied for one returned item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryAdjustment {
    pub product_id: Uuid,
    pub disposition: Disposition,
    pub quantity: i32,
    /// True when the quantity went back to sellable on-hand stock.
    pub restocked: bool,
    pub message: String,
}

/// Everything the settlement did, returned to the caller for display and audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementOutcome {
    pub return_record: Return,
    pub method: RefundMethod,
    pub amount_cents: i64,
    pub allocations: Vec<RefundAllocation>,
    pub store_credit: Option<StoreCreditGrant>,
    pub inventory_adjustments: Vec<InventoryAdjustment>,
    /// Non-fatal problems (e.g. a failed cash-drawer movement) that did not
    /// block the refund but should be surfaced to the operator.
    pub warnings: Vec<String>,
}
