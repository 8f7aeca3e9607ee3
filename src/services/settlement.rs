//! Refund settlement orchestrator.
//!
//! The only component with external side effects. A settlement is one
//! database transaction: the return row is locked first and held across the
//! processor call, trading throughput under contention for the guarantee of
//! at most one settlement per return. A processor failure rolls the whole
//! unit of work back; the cash-drawer movement is the one deliberate
//! best-effort exception, isolated in a savepoint and reported as a warning.

use std::sync::Arc;

use sqlx::Acquire;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{
    InventoryAdjustment, PaymentInstrument, RefundAllocation, RefundMethod, Return, ReturnItem,
    ReturnStatus, SettleRequest, SettlementOutcome, StoreCreditGrant,
};
use crate::services::disposition::{effective_disposition, ledger_effect, LedgerEffect};
use crate::services::lifecycle::ensure_transition;
use crate::services::metrics::{ERRORS_TOTAL, SETTLEMENTS_TOTAL};
use crate::services::processor::{CardProcessor, RefundReason};
use crate::services::Database;

/// One planned slice of the refund against an instrument, before any
/// external call is made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedAllocation {
    pub payment_id: Uuid,
    pub amount_cents: i64,
}

/// Greedy allocation of the refund amount across payment instruments,
/// largest amount first (ties broken by instrument id for determinism).
/// Returns the allocations and any shortfall left once instruments run out;
/// the shortfall becomes store credit, not an error.
pub fn allocate_refund(
    instruments: &[PaymentInstrument],
    amount_cents: i64,
) -> (Vec<PlannedAllocation>, i64) {
    let mut order: Vec<&PaymentInstrument> = instruments.iter().collect();
    order.sort_by(|a, b| {
        b.amount_cents
            .cmp(&a.amount_cents)
            .then(a.payment_id.cmp(&b.payment_id))
    });

    let mut remaining = amount_cents;
    let mut allocations = Vec::new();
    for instrument in order {
        if remaining == 0 {
            break;
        }
        let slice = remaining.min(instrument.amount_cents);
        if slice <= 0 {
            continue;
        }
        allocations.push(PlannedAllocation {
            payment_id: instrument.payment_id,
            amount_cents: slice,
        });
        remaining -= slice;
    }

    (allocations, remaining)
}

/// Drives an approved return through refund settlement: money movement,
/// store-credit fallback, inventory disposition, and finalization.
pub struct RefundSettlementOrchestrator {
    db: Database,
    processor: Arc<dyn CardProcessor>,
}

impl RefundSettlementOrchestrator {
    /// Dependencies are passed in by the composition root; the orchestrator
    /// owns no global state.
    pub fn new(db: Database, processor: Arc<dyn CardProcessor>) -> Self {
        Self { db, processor }
    }

    /// Settle a return. All ledger effects and the terminal status update
    /// commit together or not at all.
    #[instrument(skip(self, req), fields(return_id = %return_id, processed_by = %req.processed_by))]
    pub async fn settle(
        &self,
        return_id: Uuid,
        req: &SettleRequest,
    ) -> Result<SettlementOutcome, AppError> {
        let result = self.settle_inner(return_id, req).await;
        match &result {
            Ok(outcome) => {
                SETTLEMENTS_TOTAL
                    .with_label_values(&[outcome.method.as_str(), "ok"])
                    .inc();
            }
            Err(e) => {
                SETTLEMENTS_TOTAL
                    .with_label_values(&["unknown", "error"])
                    .inc();
                ERRORS_TOTAL.with_label_values(&[e.metric_label()]).inc();
                warn!(error = %e, "Settlement failed");
            }
        }
        result
    }

    async fn settle_inner(
        &self,
        return_id: Uuid,
        req: &SettleRequest,
    ) -> Result<SettlementOutcome, AppError> {
        let mut tx = self.db.pool().begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        // Lock first; held until commit, including across the processor call.
        let record = Database::load_return_locked(&mut tx, return_id).await?;
        let status = record.parsed_status().ok_or_else(|| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Return {} has unrecognized status '{}'",
                return_id,
                record.status
            ))
        })?;

        if !matches!(status, ReturnStatus::Approved | ReturnStatus::Processing) {
            return Err(AppError::InvalidState(anyhow::anyhow!(
                "Return {} has status '{}'; settlement requires 'approved' or 'processing'",
                record.return_number,
                record.status
            )));
        }

        // Settlement walks the remaining lifecycle edges itself.
        if status == ReturnStatus::Approved {
            ensure_transition(ReturnStatus::Approved, ReturnStatus::Processing)?;
        }
        ensure_transition(ReturnStatus::Processing, ReturnStatus::Completed)?;

        let method = match req.method_override {
            Some(m) => m,
            None => record.parsed_method().ok_or_else(|| {
                AppError::InvalidInput(anyhow::anyhow!(
                    "Return {} carries unknown refund method '{}'",
                    record.return_number,
                    record.refund_method
                ))
            })?,
        };

        let amount_cents = record.refund_total_cents - req.restocking_fee_cents;
        if amount_cents <= 0 {
            return Err(AppError::InvalidInput(anyhow::anyhow!(
                "Refund amount must be positive (total {} minus restocking fee {})",
                record.refund_total_cents,
                req.restocking_fee_cents
            )));
        }

        let items = Database::load_return_items(&mut tx, return_id).await?;
        let mut warnings = Vec::new();

        // Money movement per rail.
        let mut allocations: Vec<RefundAllocation> = Vec::new();
        let mut store_credit: Option<StoreCreditGrant> = None;
        let mut processor_refund_ref: Option<String> = None;

        match method {
            RefundMethod::OriginalPayment => {
                let instruments =
                    Database::load_completed_payment_instruments(&mut tx, record.order_id).await?;
                let (planned, shortfall) = allocate_refund(&instruments, amount_cents);

                for alloc in &planned {
                    let instrument = instruments
                        .iter()
                        .find(|i| i.payment_id == alloc.payment_id)
                        .ok_or_else(|| {
                            AppError::Internal(anyhow::anyhow!(
                                "Allocation references unknown instrument {}",
                                alloc.payment_id
                            ))
                        })?;

                    let refund_id = if instrument.is_card_like() {
                        let processor_ref =
                            instrument.processor_ref.as_deref().ok_or_else(|| {
                                AppError::ExternalProcessorError(anyhow::anyhow!(
                                    "Instrument {} is card-like but has no processor reference",
                                    instrument.payment_id
                                ))
                            })?;

                        // Hard dependency: a failure abandons the settlement
                        // and the transaction rolls back on drop.
                        let refund = self
                            .processor
                            .refund(
                                processor_ref,
                                alloc.amount_cents,
                                RefundReason::RequestedByCustomer,
                            )
                            .await?;
                        if processor_refund_ref.is_none() {
                            processor_refund_ref = Some(refund.id.clone());
                        }
                        Some(refund.id)
                    } else {
                        None
                    };

                    Database::append_refund_payment_entry(
                        &mut tx,
                        record.order_id,
                        &instrument.method,
                        -alloc.amount_cents,
                        Some(instrument.payment_id),
                        refund_id.as_deref(),
                        return_id,
                    )
                    .await?;

                    allocations.push(RefundAllocation {
                        payment_id: instrument.payment_id,
                        amount_cents: alloc.amount_cents,
                        processor_refund_id: refund_id,
                    });
                }

                // Instruments could not cover the refund: the remainder is
                // issued as store credit by design.
                if shortfall > 0 {
                    let credit = Database::create_store_credit(
                        &mut tx,
                        record.customer_id,
                        shortfall,
                        return_id,
                    )
                    .await?;
                    store_credit = Some(StoreCreditGrant {
                        credit,
                        amount_cents: shortfall,
                    });
                }
            }
            RefundMethod::StoreCredit => {
                let credit = Database::create_store_credit(
                    &mut tx,
                    record.customer_id,
                    amount_cents,
                    return_id,
                )
                .await?;
                store_credit = Some(StoreCreditGrant {
                    credit,
                    amount_cents,
                });
            }
            RefundMethod::Cash => {
                Database::append_refund_payment_entry(
                    &mut tx,
                    record.order_id,
                    "cash",
                    -amount_cents,
                    None,
                    None,
                    return_id,
                )
                .await?;

                if let Some(till_session_id) = req.till_session_id {
                    // Best-effort: a savepoint isolates the secondary record
                    // so its failure cannot poison the settlement.
                    let mut sp = tx.begin().await.map_err(|e| {
                        AppError::DatabaseError(anyhow::anyhow!(
                            "Failed to create savepoint: {}",
                            e
                        ))
                    })?;
                    match Database::record_till_movement(
                        &mut sp,
                        till_session_id,
                        -amount_cents,
                        "Cash refund",
                        &record.return_number,
                    )
                    .await
                    {
                        Ok(()) => {
                            sp.commit().await.map_err(|e| {
                                AppError::DatabaseError(anyhow::anyhow!(
                                    "Failed to commit savepoint: {}",
                                    e
                                ))
                            })?;
                        }
                        Err(e) => {
                            sp.rollback().await.ok();
                            warn!(error = %e, "Till movement failed; continuing settlement");
                            warnings.push(format!("Cash drawer movement not recorded: {}", e));
                        }
                    }
                }
            }
        }

        // Inventory disposition per item, after the refund path resolved.
        let mut adjustments = Vec::with_capacity(items.len());
        for item in &items {
            let adjustment = self
                .route_disposition(&mut tx, &record, item, req)
                .await?;
            adjustments.push(adjustment);
        }

        let completed = Database::finalize_return(
            &mut tx,
            return_id,
            method.as_str(),
            req.restocking_fee_cents,
            processor_refund_ref.as_deref(),
            store_credit.as_ref().map(|g| g.credit.credit_id),
            req.processed_by,
        )
        .await?;

        Database::recompute_paid_due(&mut tx, record.order_id).await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit settlement: {}", e))
        })?;

        info!(
            return_id = %return_id,
            return_number = %completed.return_number,
            method = %method,
            amount_cents = amount_cents,
            allocation_count = allocations.len(),
            store_credit = store_credit.is_some(),
            "Return settled"
        );

        Ok(SettlementOutcome {
            return_record: completed,
            method,
            amount_cents,
            allocations,
            store_credit,
            inventory_adjustments: adjustments,
            warnings,
        })
    }

    /// Apply one item's inventory disposition: persist the decision, then
    /// make the matching ledger call.
    async fn route_disposition(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        record: &Return,
        item: &ReturnItem,
        req: &SettleRequest,
    ) -> Result<InventoryAdjustment, AppError> {
        let override_disposition = req.disposition_overrides.get(&item.return_item_id).copied();
        let disposition = effective_disposition(item.parsed_condition(), override_disposition);

        Database::set_item_disposition(tx, item.return_item_id, disposition.as_str()).await?;

        let (restocked, message) = match ledger_effect(disposition) {
            LedgerEffect::Restore { reason } => {
                let message = Database::restore_stock(
                    tx,
                    item.product_id,
                    item.quantity,
                    reason,
                    record.return_id,
                    &record.return_number,
                    req.processed_by,
                )
                .await?;
                (true, message)
            }
            LedgerEffect::AuditOnly { reason } => {
                let message = Database::append_inventory_audit(
                    tx,
                    item.product_id,
                    reason,
                    record.return_id,
                    &record.return_number,
                    req.processed_by,
                )
                .await?;
                (false, message)
            }
        };

        Ok(InventoryAdjustment {
            product_id: item.product_id,
            disposition,
            quantity: item.quantity,
            restocked,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instrument(amount_cents: i64, method: &str) -> PaymentInstrument {
        PaymentInstrument {
            payment_id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            method: method.to_string(),
            amount_cents,
            processor_ref: Some("ch_test".to_string()),
        }
    }

    #[test]
    fn allocates_largest_instrument_first() {
        // $30 and $20 card payments; $45 refund allocates $30 then $15.
        let a = instrument(3_000, "card");
        let b = instrument(2_000, "card");
        let (allocations, shortfall) = allocate_refund(&[b.clone(), a.clone()], 4_500);

        assert_eq!(shortfall, 0);
        assert_eq!(allocations.len(), 2);
        assert_eq!(allocations[0].payment_id, a.payment_id);
        assert_eq!(allocations[0].amount_cents, 3_000);
        assert_eq!(allocations[1].payment_id, b.payment_id);
        assert_eq!(allocations[1].amount_cents, 1_500);
    }

    #[test]
    fn shortfall_becomes_overflow_not_error() {
        // $45 against a single $30 instrument leaves $15 for store credit.
        let a = instrument(3_000, "card");
        let (allocations, shortfall) = allocate_refund(&[a.clone()], 4_500);

        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].amount_cents, 3_000);
        assert_eq!(shortfall, 1_500);
    }

    #[test]
    fn never_allocates_more_than_an_instrument_holds() {
        let instruments = vec![
            instrument(1_000, "card"),
            instrument(2_500, "cash"),
            instrument(700, "card"),
        ];
        let (allocations, shortfall) = allocate_refund(&instruments, 4_000);

        let total: i64 = allocations.iter().map(|a| a.amount_cents).sum();
        assert_eq!(total + shortfall, 4_000);
        for alloc in &allocations {
            let source = instruments
                .iter()
                .find(|i| i.payment_id == alloc.payment_id)
                .unwrap();
            assert!(alloc.amount_cents <= source.amount_cents);
        }
    }

    #[test]
    fn exact_cover_leaves_no_shortfall_and_skips_extra_instruments() {
        let a = instrument(5_000, "card");
        let b = instrument(100, "card");
        let (allocations, shortfall) = allocate_refund(&[a.clone(), b], 5_000);

        assert_eq!(shortfall, 0);
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].payment_id, a.payment_id);
    }

    #[test]
    fn no_instruments_means_full_shortfall() {
        let (allocations, shortfall) = allocate_refund(&[], 2_000);
        assert!(allocations.is_empty());
        assert_eq!(shortfall, 2_000);
    }

    #[test]
    fn equal_amounts_tie_break_on_payment_id() {
        let mut a = instrument(1_000, "card");
        let mut b = instrument(1_000, "card");
        if b.payment_id < a.payment_id {
            std::mem::swap(&mut a, &mut b);
        }
        let (allocations, _) = allocate_refund(&[b.clone(), a.clone()], 500);
        assert_eq!(allocations[0].payment_id, a.payment_id);
    }
}
