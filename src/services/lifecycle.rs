//! Return lifecycle state machine.
//!
//! Status is mutated only through [`crate::services::Database::transition_return`],
//! which consults this table while holding a row lock on the return.

use crate::error::AppError;
use crate::models::ReturnStatus;

/// Check that `from -> to` is a legal edge of the lifecycle.
///
/// Legal edges:
/// - `initiated -> approved | rejected | cancelled`
/// - `approved -> processing | cancelled`
/// - `processing -> completed`
pub fn ensure_transition(from: ReturnStatus, to: ReturnStatus) -> Result<(), AppError> {
    use ReturnStatus::*;

    let legal = matches!(
        (from, to),
        (Initiated, Approved)
            | (Initiated, Rejected)
            | (Initiated, Cancelled)
            | (Approved, Processing)
            | (Approved, Cancelled)
            | (Processing, Completed)
    );

    if legal {
        Ok(())
    } else {
        Err(AppError::InvalidTransition { from, to })
    }
}
