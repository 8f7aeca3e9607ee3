//! Services for returns-service.

pub mod credit;
pub mod database;
pub mod disposition;
pub mod lifecycle;
pub mod metrics;
pub mod processor;
pub mod settlement;
pub mod validation;

pub use database::Database;
pub use processor::{CardProcessor, HttpCardProcessor};
pub use settlement::RefundSettlementOrchestrator;
