//! Returns Service - return and refund settlement engine for the retail
//! back office.
//!
//! Library crate: the surrounding HTTP layer owns routing, validation of
//! request shapes, and authorization, and invokes this core. The composition
//! root builds a [`services::Database`], a [`services::CardProcessor`]
//! implementation, and a [`services::RefundSettlementOrchestrator`].

pub mod config;
pub mod error;
pub mod models;
pub mod observability;
pub mod services;

pub use error::AppError;
