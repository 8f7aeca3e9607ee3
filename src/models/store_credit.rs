//! Store credit ledger shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditTransactionType {
    Issue,
    Redeem,
    Adjust,
}

impl CreditTransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditTransactionType::Issue => "issue",
            CreditTransactionType::Redeem => "redeem",
            CreditTransactionType::Adjust => "adjust",
        }
    }
}

/// Store credit balance issued to a customer.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StoreCredit {
    pub credit_id: Uuid,
    pub code: String,
    pub customer_id: Option<Uuid>,
    pub original_amount_cents: i64,
    pub balance_cents: i64,
    pub source_return_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
}
