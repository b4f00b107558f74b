//! Monthly interview quota
//!
//! Ties the subscription resolver, the usage counters and the limit enforcer
//! together. Each operation holds the store lock from resolution to write.

use std::sync::Arc;
use tracing::{info, warn};

use super::limits::LimitEnforcer;
use super::store::Database;
use super::subscription::resolve_active;
use super::types::{ActiveSubscription, LimitCheckResult, QuotaStatus};
use super::usage::{increment_count, read_count, try_consume, UsageKey};
use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};

pub struct QuotaCounter {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    enforcer: LimitEnforcer,
    /// Reported when the user has no subscription at all
    default_monthly_limit: u32,
}

impl QuotaCounter {
    pub fn new(
        db: Arc<Database>,
        clock: Arc<dyn Clock>,
        enforcer: LimitEnforcer,
        default_monthly_limit: u32,
    ) -> Self {
        Self {
            db,
            clock,
            enforcer,
            default_monthly_limit,
        }
    }

    fn key_for(&self, user_id: i64, subscription: &ActiveSubscription) -> UsageKey {
        let (year, month) = self.clock.year_month();
        UsageKey {
            user_id,
            subscription_instance_id: subscription.subscription_instance_id,
            year,
            month,
        }
    }

    /// Read-only summary for the current month
    pub fn quota_status(&self, user_id: i64) -> BillingResult<QuotaStatus> {
        let mut conn = self.db.lock();
        let Some(subscription) = resolve_active(&mut conn, user_id, self.clock.now())? else {
            return Ok(QuotaStatus::new(Some(self.default_monthly_limit), 0));
        };

        let used = read_count(&conn, &self.key_for(user_id, &subscription))?;
        Ok(self.enforcer.status(&subscription, used))
    }

    /// Pre-flight check without consuming
    pub fn check_quota(&self, user_id: i64) -> BillingResult<QuotaStatus> {
        let mut conn = self.db.lock();
        let subscription = resolve_active(&mut conn, user_id, self.clock.now())?;
        let used = match &subscription {
            Some(sub) => read_count(&conn, &self.key_for(user_id, sub))?,
            None => 0,
        };

        match self.enforcer.check_limit(subscription.as_ref(), used) {
            LimitCheckResult::Denied { reason } => {
                warn!(user_id, %reason, "Quota check denied");
                Err(reason.into())
            }
            LimitCheckResult::Allowed { .. } => {
                // check_limit only allows when a subscription exists
                let subscription = subscription.ok_or(BillingError::NoActiveSubscription)?;
                Ok(self.enforcer.status(&subscription, used))
            }
        }
    }

    /// Atomically check the limit and consume one unit
    pub fn check_and_consume_quota(&self, user_id: i64) -> BillingResult<QuotaStatus> {
        let mut conn = self.db.lock();
        let now = self.clock.now();
        let subscription =
            resolve_active(&mut conn, user_id, now)?.ok_or(BillingError::NoActiveSubscription)?;
        let key = self.key_for(user_id, &subscription);

        match try_consume(&conn, &key, subscription.monthly_limit, now)? {
            Some(used) => {
                info!(
                    user_id,
                    instance_id = subscription.subscription_instance_id,
                    used,
                    limit = ?subscription.monthly_limit,
                    "Consumed interview quota"
                );
                Ok(self.enforcer.status(&subscription, used))
            }
            None => {
                let used = read_count(&conn, &key)?;
                let limit = subscription.monthly_limit.unwrap_or(0);
                warn!(user_id, used, limit, "Monthly interview limit reached");
                Err(BillingError::QuotaExceeded { limit, used })
            }
        }
    }

    /// Record one unit of completed work unconditionally
    ///
    /// For work admitted earlier through [`Self::check_quota`].
    pub fn record_usage(&self, user_id: i64) -> BillingResult<QuotaStatus> {
        let mut conn = self.db.lock();
        let now = self.clock.now();
        let subscription =
            resolve_active(&mut conn, user_id, now)?.ok_or(BillingError::NoActiveSubscription)?;

        let used = increment_count(&conn, &self.key_for(user_id, &subscription), now)?;
        Ok(self.enforcer.status(&subscription, used))
    }
}
