//! Inventory disposition routing.
//!
//! Maps a returned item's physical condition to an inventory ledger effect.
//! Restock and clearance both put the quantity back into sellable on-hand
//! stock and differ only in the reason string; RMA and disposal leave
//! availability untouched and write an audit-only entry.

use crate::models::{Disposition, ItemCondition};

/// Ledger call the router selected for an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEffect {
    /// Restore the quantity to sellable on-hand stock.
    Restore { reason: &'static str },
    /// Append a zero-delta entry (before == after) for traceability only.
    AuditOnly { reason: &'static str },
}

/// Effective disposition: the caller-supplied override when present, else
/// derived from the item's condition.
pub fn effective_disposition(
    condition: ItemCondition,
    override_disposition: Option<Disposition>,
) -> Disposition {
    if let Some(d) = override_disposition {
        return d;
    }
    match condition {
        ItemCondition::Resellable => Disposition::ReturnToStock,
        ItemCondition::Damaged => Disposition::Clearance,
        ItemCondition::Defective => Disposition::RmaVendor,
        ItemCondition::Disposed => Disposition::Dispose,
    }
}

/// Ledger effect and human-readable reason for a disposition.
pub fn ledger_effect(disposition: Disposition) -> LedgerEffect {
    match disposition {
        Disposition::ReturnToStock => LedgerEffect::Restore {
            reason: "Customer return - restocked",
        },
        Disposition::Clearance => LedgerEffect::Restore {
            reason: "Customer return - moved to clearance",
        },
        Disposition::RmaVendor => LedgerEffect::AuditOnly {
            reason: "Customer return - vendor RMA",
        },
        Disposition::Dispose => LedgerEffect::AuditOnly {
            reason: "Customer return - disposed",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_derives_disposition() {
        assert_eq!(
            effective_disposition(ItemCondition::Resellable, None),
            Disposition::ReturnToStock
        );
        assert_eq!(
            effective_disposition(ItemCondition::Damaged, None),
            Disposition::Clearance
        );
        assert_eq!(
            effective_disposition(ItemCondition::Defective, None),
            Disposition::RmaVendor
        );
        assert_eq!(
            effective_disposition(ItemCondition::Disposed, None),
            Disposition::Dispose
        );
    }

    #[test]
    fn override_wins_over_condition() {
        assert_eq!(
            effective_disposition(ItemCondition::Resellable, Some(Disposition::Dispose)),
            Disposition::Dispose
        );
    }

    #[test]
    fn rma_and_dispose_do_not_restock() {
        for d in [Disposition::RmaVendor, Disposition::Dispose] {
            assert!(matches!(ledger_effect(d), LedgerEffect::AuditOnly { .. }));
        }
        for d in [Disposition::ReturnToStock, Disposition::Clearance] {
            assert!(matches!(ledger_effect(d), LedgerEffect::Restore { .. }));
        }
    }

    #[test]
    fn restock_and_clearance_reasons_differ() {
        let restock = ledger_effect(Disposition::ReturnToStock);
        let clearance = ledger_effect(Disposition::Clearance);
        assert_ne!(restock, clearance);
    }
}
