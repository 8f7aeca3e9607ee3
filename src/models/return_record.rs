//! Return model: one return case against exactly one original order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::ItemCondition;

/// Return lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnStatus {
    Initiated,
    Approved,
    Rejected,
    Processing,
    Completed,
    Cancelled,
}

impl ReturnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReturnStatus::Initiated => "initiated",
            ReturnStatus::Approved => "approved",
            ReturnStatus::Rejected => "rejected",
            ReturnStatus::Processing => "processing",
            ReturnStatus::Completed => "completed",
            ReturnStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initiated" => Some(ReturnStatus::Initiated),
            "approved" => Some(ReturnStatus::Approved),
            "rejected" => Some(ReturnStatus::Rejected),
            "processing" => Some(ReturnStatus::Processing),
            "completed" => Some(ReturnStatus::Completed),
            "cancelled" => Some(ReturnStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses permit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReturnStatus::Rejected | ReturnStatus::Completed | ReturnStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ReturnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Full return (every line fully returned in one request) or partial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnType {
    Full,
    Partial,
}

impl ReturnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReturnType::Full => "full",
            ReturnType::Partial => "partial",
        }
    }
}

/// Rail the refund settles through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundMethod {
    OriginalPayment,
    StoreCredit,
    Cash,
}

impl RefundMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundMethod::OriginalPayment => "original_payment",
            RefundMethod::StoreCredit => "store_credit",
            RefundMethod::Cash => "cash",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "original_payment" => Some(RefundMethod::OriginalPayment),
            "store_credit" => Some(RefundMethod::StoreCredit),
            "cash" => Some(RefundMethod::Cash),
            _ => None,
        }
    }
}

impl std::fmt::Display for RefundMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Return record.
///
/// `refund_total_cents == refund_subtotal_cents + refund_tax_cents` at creation;
/// the only later reduction is the restocking fee applied at settlement.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Return {
    pub return_id: Uuid,
    pub return_number: String,
    pub order_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub return_type: String,
    pub status: String,
    pub refund_subtotal_cents: i64,
    pub refund_tax_cents: i64,
    pub refund_total_cents: i64,
    pub restocking_fee_cents: i64,
    pub refund_method: String,
    pub processor_refund_ref: Option<String>,
    pub store_credit_id: Option<Uuid>,
    pub initiated_by: Uuid,
    pub approved_by: Option<Uuid>,
    pub processed_by: Option<Uuid>,
    pub rejection_reason: Option<String>,
    pub notes: Option<String>,
    pub initiated_utc: DateTime<Utc>,
    pub approved_utc: Option<DateTime<Utc>>,
    pub completed_utc: Option<DateTime<Utc>>,
}

impl Return {
    pub fn parsed_status(&self) -> Option<ReturnStatus> {
        ReturnStatus::parse(&self.status)
    }

    pub fn parsed_method(&self) -> Option<RefundMethod> {
        RefundMethod::parse(&self.refund_method)
    }
}

/// One requested line of a new return.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnItemRequest {
    pub order_line_id: Uuid,
    pub quantity: i32,
    pub reason_code: String,
    pub reason_notes: Option<String>,
    pub condition: ItemCondition,
}

/// Input for creating a return.
#[derive(Debug, Clone)]
pub struct CreateReturn {
    pub order_id: Uuid,
    pub items: Vec<ReturnItemRequest>,
    pub refund_method: RefundMethod,
    pub return_type_override: Option<ReturnType>,
    pub initiated_by: Uuid,
    pub notes: Option<String>,
}

/// Filter parameters for listing returns.
#[derive(Debug, Clone, Default)]
pub struct ListReturnsFilter {
    pub status: Option<ReturnStatus>,
    pub order_id: Option<Uuid>,
    pub customer_id: Option<Uuid>,
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}
