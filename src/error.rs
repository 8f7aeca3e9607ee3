//! Error type for the returns core.
//!
//! Validation and state errors are detected before any mutation and carry
//! enough structure to render a specific message. Settlement errors detected
//! mid-transaction roll the whole unit of work back.

use crate::models::ReturnStatus;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(anyhow::Error),

    #[error("Invalid state: {0}")]
    InvalidState(anyhow::Error),

    #[error(
        "Returnable quantity exceeded on line {order_line_id}: requested {requested}, remaining {remaining}"
    )]
    QuantityExceeded {
        order_line_id: Uuid,
        requested: i64,
        remaining: i64,
    },

    #[error("Illegal status transition from '{from}' to '{to}'")]
    InvalidTransition {
        from: ReturnStatus,
        to: ReturnStatus,
    },

    #[error("Card processor refund failed: {0}")]
    ExternalProcessorError(anyhow::Error),

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Stable label for the errors_total metric.
    pub fn metric_label(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::InvalidInput(_) => "invalid_input",
            AppError::InvalidState(_) => "invalid_state",
            AppError::QuantityExceeded { .. } => "quantity_exceeded",
            AppError::InvalidTransition { .. } => "invalid_transition",
            AppError::ExternalProcessorError(_) => "processor_error",
            AppError::DatabaseError(_) => "db_error",
            AppError::ConfigError(_) => "config_error",
            AppError::Internal(_) => "internal",
        }
    }
}
