//! Return quantity validation and refund calculation.
//!
//! Pure: operates on typed order/line snapshots fetched by the database
//! service. The caller is responsible for holding the order-line locks that
//! make the already-returned sums trustworthy until the insert commits.

use std::collections::HashMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{ItemCondition, OrderLine, OrderSummary, ReturnItemRequest, ReturnType};

/// One validated line with its computed refund.
#[derive(Debug, Clone)]
pub struct PlannedItem {
    pub order_line_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price_cents: i64,
    pub refund_amount_cents: i64,
    pub reason_code: String,
    pub reason_notes: Option<String>,
    pub condition: ItemCondition,
}

/// Validated return ready to insert.
#[derive(Debug, Clone)]
pub struct ReturnPlan {
    pub items: Vec<PlannedItem>,
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
    pub return_type: ReturnType,
}

/// Validate requested return quantities against the order and prior returns,
/// then compute the refund amounts.
///
/// `already_returned` maps order line id to the summed quantity across all
/// return items whose parent return is not cancelled/rejected.
pub fn plan_return(
    order: &OrderSummary,
    lines: &[OrderLine],
    already_returned: &HashMap<Uuid, i64>,
    items: &[ReturnItemRequest],
    type_override: Option<ReturnType>,
) -> Result<ReturnPlan, AppError> {
    if !order.is_post_sale() {
        return Err(AppError::InvalidState(anyhow::anyhow!(
            "Order {} has status '{}' and is not eligible for returns",
            order.order_id,
            order.status
        )));
    }

    if items.is_empty() {
        return Err(AppError::InvalidInput(anyhow::anyhow!(
            "A return requires at least one item"
        )));
    }

    let line_map: HashMap<Uuid, &OrderLine> =
        lines.iter().map(|l| (l.order_line_id, l)).collect();

    // Aggregate per line so a request naming the same line twice cannot slip
    // past the remaining-quantity check.
    let mut requested_per_line: HashMap<Uuid, i64> = HashMap::new();

    for item in items {
        let line = line_map.get(&item.order_line_id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!(
                "Order line {} does not belong to order {}",
                item.order_line_id,
                order.order_id
            ))
        })?;

        if item.quantity <= 0 || item.quantity > line.quantity {
            return Err(AppError::InvalidInput(anyhow::anyhow!(
                "Invalid quantity {} for order line {} (sold quantity {})",
                item.quantity,
                item.order_line_id,
                line.quantity
            )));
        }

        *requested_per_line.entry(item.order_line_id).or_insert(0) += i64::from(item.quantity);
    }

    for (line_id, requested) in &requested_per_line {
        let line = line_map[line_id];
        let prior = already_returned.get(line_id).copied().unwrap_or(0);
        let remaining = i64::from(line.quantity) - prior;
        if *requested > remaining {
            return Err(AppError::QuantityExceeded {
                order_line_id: *line_id,
                requested: *requested,
                remaining,
            });
        }
    }

    let mut planned = Vec::with_capacity(items.len());
    let mut subtotal_cents: i64 = 0;
    for item in items {
        let line = line_map[&item.order_line_id];
        let refund = line.unit_price_cents * i64::from(item.quantity);
        subtotal_cents += refund;
        planned.push(PlannedItem {
            order_line_id: item.order_line_id,
            product_id: line.product_id,
            quantity: item.quantity,
            unit_price_cents: line.unit_price_cents,
            refund_amount_cents: refund,
            reason_code: item.reason_code.clone(),
            reason_notes: item.reason_notes.clone(),
            condition: item.condition,
        });
    }

    let tax_cents = compute_tax(subtotal_cents, order)?;

    let return_type = type_override.unwrap_or_else(|| {
        let full = lines.iter().all(|line| {
            requested_per_line
                .get(&line.order_line_id)
                .copied()
                .unwrap_or(0)
                == i64::from(line.quantity)
        });
        if full {
            ReturnType::Full
        } else {
            ReturnType::Partial
        }
    });

    Ok(ReturnPlan {
        items: planned,
        subtotal_cents,
        tax_cents,
        total_cents: subtotal_cents + tax_cents,
        return_type,
    })
}

/// Tax on the refund: zero for tax-exempt orders, otherwise the combined rate
/// applied once to the aggregate subtotal and rounded half-up at the minor
/// unit. Single-pass rounding keeps refunds aligned with historical amounts.
fn compute_tax(subtotal_cents: i64, order: &OrderSummary) -> Result<i64, AppError> {
    if order.tax_exempt {
        return Ok(0);
    }

    let tax = (Decimal::from(subtotal_cents) * order.tax_rate)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);

    tax.to_i64().ok_or_else(|| {
        AppError::Internal(anyhow::anyhow!(
            "Tax amount {} out of range for subtotal {}",
            tax,
            subtotal_cents
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(tax_rate: &str, tax_exempt: bool) -> OrderSummary {
        OrderSummary {
            order_id: Uuid::new_v4(),
            customer_id: Some(Uuid::new_v4()),
            status: "completed".to_string(),
            tax_rate: tax_rate.parse().unwrap(),
            tax_exempt,
            total_cents: 10_000,
        }
    }

    fn line(order_id: Uuid, quantity: i32, unit_price_cents: i64) -> OrderLine {
        OrderLine {
            order_line_id: Uuid::new_v4(),
            order_id,
            product_id: Uuid::new_v4(),
            quantity,
            unit_price_cents,
        }
    }

    fn request(line: &OrderLine, quantity: i32) -> ReturnItemRequest {
        ReturnItemRequest {
            order_line_id: line.order_line_id,
            quantity,
            reason_code: "changed_mind".to_string(),
            reason_notes: None,
            condition: ItemCondition::Resellable,
        }
    }

    #[test]
    fn partial_return_then_over_return_is_rejected() {
        let order = order("0", true);
        let l = line(order.order_id, 3, 1_000);
        let lines = vec![l.clone()];

        // First request for 2 of 3 passes.
        let plan = plan_return(&order, &lines, &HashMap::new(), &[request(&l, 2)], None).unwrap();
        assert_eq!(plan.subtotal_cents, 2_000);
        assert_eq!(plan.return_type, ReturnType::Partial);

        // With 2 already returned, a second request for 2 exceeds the
        // remaining 1.
        let mut prior = HashMap::new();
        prior.insert(l.order_line_id, 2_i64);
        let err = plan_return(&order, &lines, &prior, &[request(&l, 2)], None).unwrap_err();
        match err {
            AppError::QuantityExceeded {
                order_line_id,
                requested,
                remaining,
            } => {
                assert_eq!(order_line_id, l.order_line_id);
                assert_eq!(requested, 2);
                assert_eq!(remaining, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn duplicate_lines_in_one_request_are_summed() {
        let order = order("0", true);
        let l = line(order.order_id, 3, 1_000);
        let lines = vec![l.clone()];

        let err = plan_return(
            &order,
            &lines,
            &HashMap::new(),
            &[request(&l, 2), request(&l, 2)],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, AppError::QuantityExceeded { .. }));
    }

    #[test]
    fn zero_and_oversize_quantities_are_invalid_input() {
        let order = order("0", true);
        let l = line(order.order_id, 3, 1_000);
        let lines = vec![l.clone()];

        for qty in [0, -1, 4] {
            let err =
                plan_return(&order, &lines, &HashMap::new(), &[request(&l, qty)], None)
                    .unwrap_err();
            assert!(matches!(err, AppError::InvalidInput(_)), "qty {qty}");
        }
    }

    #[test]
    fn unknown_line_is_not_found() {
        let order = order("0", true);
        let l = line(order.order_id, 3, 1_000);
        let foreign = line(Uuid::new_v4(), 1, 500);

        let err = plan_return(
            &order,
            &[l],
            &HashMap::new(),
            &[request(&foreign, 1)],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn empty_request_is_invalid_input() {
        let order = order("0", true);
        let lines = vec![line(order.order_id, 3, 1_000)];
        let err = plan_return(&order, &lines, &HashMap::new(), &[], None).unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[test]
    fn non_post_sale_order_is_invalid_state() {
        let mut order = order("0", true);
        order.status = "pending".to_string();
        let l = line(order.order_id, 1, 1_000);
        let err =
            plan_return(&order, &[l.clone()], &HashMap::new(), &[request(&l, 1)], None)
                .unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
    }

    #[test]
    fn tax_is_rounded_half_up_once_on_the_aggregate() {
        // 3 * 333 = 999; 999 * 0.13 = 129.87 -> 130. Per-line rounding of
        // 333 * 0.13 = 43.29 -> 43 each would give 129.
        let order = order("0.13", false);
        let l1 = line(order.order_id, 1, 333);
        let l2 = line(order.order_id, 1, 333);
        let l3 = line(order.order_id, 1, 333);
        let lines = vec![l1.clone(), l2.clone(), l3.clone()];

        let plan = plan_return(
            &order,
            &lines,
            &HashMap::new(),
            &[request(&l1, 1), request(&l2, 1), request(&l3, 1)],
            None,
        )
        .unwrap();

        assert_eq!(plan.subtotal_cents, 999);
        assert_eq!(plan.tax_cents, 130);
        assert_eq!(plan.total_cents, 1_129);
    }

    #[test]
    fn tax_exempt_order_has_zero_tax() {
        let order = order("0.13", true);
        let l = line(order.order_id, 2, 500);
        let plan =
            plan_return(&order, &[l.clone()], &HashMap::new(), &[request(&l, 2)], None).unwrap();
        assert_eq!(plan.tax_cents, 0);
        assert_eq!(plan.total_cents, 1_000);
    }

    #[test]
    fn full_type_only_when_every_line_fully_returned() {
        let order = order("0", true);
        let l1 = line(order.order_id, 2, 500);
        let l2 = line(order.order_id, 1, 700);
        let lines = vec![l1.clone(), l2.clone()];

        let plan = plan_return(
            &order,
            &lines,
            &HashMap::new(),
            &[request(&l1, 2), request(&l2, 1)],
            None,
        )
        .unwrap();
        assert_eq!(plan.return_type, ReturnType::Full);

        let plan = plan_return(&order, &lines, &HashMap::new(), &[request(&l1, 2)], None).unwrap();
        assert_eq!(plan.return_type, ReturnType::Partial);

        // Caller override wins.
        let plan = plan_return(
            &order,
            &lines,
            &HashMap::new(),
            &[request(&l1, 2)],
            Some(ReturnType::Full),
        )
        .unwrap();
        assert_eq!(plan.return_type, ReturnType::Full);
    }

    #[test]
    fn subtotal_tax_total_invariant_holds() {
        let order = order("0.0825", false);
        let l = line(order.order_id, 3, 1_999);
        let plan =
            plan_return(&order, &[l.clone()], &HashMap::new(), &[request(&l, 3)], None).unwrap();
        assert_eq!(plan.total_cents, plan.subtotal_cents + plan.tax_cents);
    }
}
