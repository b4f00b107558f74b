//! Command handlers called by the outer request layer
//!
//! Each handler validates its input, delegates to [`crate::billing::BillingState`]
//! and converts failures into an [`crate::error::ErrorResponse`].

pub mod billing;
pub mod plans;

pub use billing::*;
pub use plans::*;

use crate::error::BillingError;

/// Required request field
pub(crate) fn require<T>(value: Option<T>, field: &str) -> Result<T, BillingError> {
    value.ok_or_else(|| BillingError::BadRequest(format!("{} is required", field)))
}

/// Required non-blank string field
pub(crate) fn require_text(value: Option<String>, field: &str) -> Result<String, BillingError> {
    let value = require(value, field)?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(BillingError::BadRequest(format!("{} must not be empty", field)));
    }
    Ok(trimmed.to_string())
}
