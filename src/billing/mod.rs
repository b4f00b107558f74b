//! Billing module for subscriptions and interview quotas
//!
//! This module handles:
//! - Plan catalog management
//! - Subscription instance lifecycle (free grant, expiry, renewal)
//! - Gateway orders and payment signature verification
//! - Monthly interview counters and limit enforcement

mod gateway;
mod limits;
mod payments;
mod plans;
mod quota;
mod signature;
mod store;
mod subscription;
mod types;
mod usage;

pub use gateway::{PaymentGateway, RazorpayGateway};
pub use limits::LimitEnforcer;
pub use payments::{validity_window, PaymentReconciler};
pub use plans::PlanCatalog;
pub use quota::QuotaCounter;
pub use signature::PaymentSigner;
pub use store::Database;
pub use subscription::SubscriptionManager;
pub use types::{
    ActivatedSubscription, ActiveSubscription, CreatedOrder, GatewayOrder, LimitCheckResult,
    LimitDenialReason, MonthlyUsage, NewPlan, OrderRequest, Plan, PlanUpdate, QuotaStatus,
    SubscriptionDetails, SubscriptionInstance, SubscriptionStatus,
};
pub use usage::{UsageKey, UsageTracker};

use std::sync::Arc;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::BillingConfig;
use crate::error::BillingResult;

/// Billing services sharing one store and clock
pub struct BillingState {
    pub plans: PlanCatalog,
    pub subscriptions: SubscriptionManager,
    pub usage: UsageTracker,
    pub quota: QuotaCounter,
    pub payments: PaymentReconciler,
}

impl BillingState {
    /// Open the configured database and wire the Razorpay gateway
    pub fn new(config: &BillingConfig) -> BillingResult<Self> {
        let db = Arc::new(Database::open(&config.database_path)?);
        info!(path = %config.database_path.display(), "Opened billing database");

        let gateway = Arc::new(RazorpayGateway::new(config.gateway.clone()));
        Ok(Self::with_parts(
            db,
            Arc::new(SystemClock),
            gateway,
            config.gateway.key_secret.clone(),
            config.currency.clone(),
            config.default_monthly_limit,
        ))
    }

    /// Wire services from explicit parts
    pub fn with_parts(
        db: Arc<Database>,
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn PaymentGateway>,
        signing_secret: impl Into<Vec<u8>>,
        currency: impl Into<String>,
        default_monthly_limit: u32,
    ) -> Self {
        Self {
            plans: PlanCatalog::new(db.clone(), clock.clone()),
            subscriptions: SubscriptionManager::new(db.clone(), clock.clone()),
            usage: UsageTracker::new(db.clone(), clock.clone()),
            quota: QuotaCounter::new(
                db.clone(),
                clock.clone(),
                LimitEnforcer::new(),
                default_monthly_limit,
            ),
            payments: PaymentReconciler::new(
                db,
                clock,
                gateway,
                PaymentSigner::new(signing_secret),
                currency,
            ),
        }
    }
}
