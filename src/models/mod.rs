//! Data models for returns-service.

mod order;
mod return_item;
mod return_record;
mod settlement;
mod store_credit;

pub use order::{OrderLine, OrderSummary, PaymentInstrument};
pub use return_item::{Disposition, ItemCondition, ReturnItem};
pub use return_record::{
    CreateReturn, ListReturnsFilter, RefundMethod, Return, ReturnItemRequest, ReturnStatus,
    ReturnType,
};
pub use settlement::{
    InventoryAdjustment, RefundAllocation, SettleRequest, SettlementOutcome, StoreCreditGrant,
};
pub use store_credit::{CreditTransactionType, StoreCredit};
