//! Limit enforcement for interview generation
//!
//! Compares the current month's usage against the plan's monthly limit.

use super::types::{ActiveSubscription, LimitCheckResult, LimitDenialReason, QuotaStatus};
use crate::error::BillingError;

/// Limit enforcement service
#[derive(Debug, Clone, Copy, Default)]
pub struct LimitEnforcer;

impl LimitEnforcer {
    pub fn new() -> Self {
        Self
    }

    /// Check whether one more unit of work fits
    ///
    /// Returns `LimitCheckResult::Allowed` with the remaining count (None when
    /// unlimited), or `LimitCheckResult::Denied` with the reason.
    pub fn check_limit(&self, subscription: Option<&ActiveSubscription>, used: u32) -> LimitCheckResult {
        let Some(subscription) = subscription else {
            return LimitCheckResult::Denied {
                reason: LimitDenialReason::NoActiveSubscription,
            };
        };

        match subscription.monthly_limit {
            None => LimitCheckResult::Allowed { remaining: None },
            Some(limit) if used >= limit => LimitCheckResult::Denied {
                reason: LimitDenialReason::MonthlyLimitExceeded { limit, used },
            },
            Some(limit) => LimitCheckResult::Allowed {
                remaining: Some(limit - used),
            },
        }
    }

    /// Summary shown to the user
    pub fn status(&self, subscription: &ActiveSubscription, used: u32) -> QuotaStatus {
        QuotaStatus::new(subscription.monthly_limit, used)
    }
}

impl From<LimitDenialReason> for BillingError {
    fn from(reason: LimitDenialReason) -> Self {
        match reason {
            LimitDenialReason::MonthlyLimitExceeded { limit, used } => {
                BillingError::QuotaExceeded { limit, used }
            }
            LimitDenialReason::NoActiveSubscription => BillingError::NoActiveSubscription,
        }
    }
}
