//! Commands for subscriptions, payments and interview quotas

use serde::Deserialize;

use super::{require, require_text};
use crate::billing::{
    ActivatedSubscription, ActiveSubscription, BillingState, CreatedOrder, MonthlyUsage,
    QuotaStatus, SubscriptionDetails, SubscriptionInstance,
};
use crate::error::ErrorResponse;

/// Request carrying only the caller's user id
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRequest {
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub user_id: Option<i64>,
    pub plan_id: Option<i64>,
}

/// Payment callback fields, accepted under either naming
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyPaymentRequest {
    #[serde(alias = "razorpay_order_id")]
    pub order_id: Option<String>,
    #[serde(alias = "razorpay_payment_id")]
    pub payment_id: Option<String>,
    #[serde(alias = "razorpay_signature")]
    pub signature: Option<String>,
}

/// Get the current usable subscription, granting the free plan if needed
pub fn get_active_subscription(
    billing: &BillingState,
    request: UserRequest,
) -> Result<Option<ActiveSubscription>, ErrorResponse> {
    let user_id = require(request.user_id, "userId")?;
    Ok(billing.subscriptions.get_active_subscription(user_id)?)
}

/// Get the preferred active subscription with plan details
pub fn get_subscription_details(
    billing: &BillingState,
    request: UserRequest,
) -> Result<Option<SubscriptionDetails>, ErrorResponse> {
    let user_id = require(request.user_id, "userId")?;
    Ok(billing.subscriptions.subscription_details(user_id)?)
}

/// List every subscription instance for a user
pub fn list_user_subscriptions(
    billing: &BillingState,
    request: UserRequest,
) -> Result<Vec<SubscriptionInstance>, ErrorResponse> {
    let user_id = require(request.user_id, "userId")?;
    Ok(billing.subscriptions.list_user_subscriptions(user_id)?)
}

/// Create a gateway order for a paid plan
pub async fn create_order(
    billing: &BillingState,
    request: CreateOrderRequest,
) -> Result<CreatedOrder, ErrorResponse> {
    let user_id = require(request.user_id, "userId")?;
    let plan_id = require(request.plan_id, "planId")?;
    Ok(billing.payments.create_order(user_id, plan_id).await?)
}

/// Verify a completed payment and activate the subscription
pub fn verify_payment(
    billing: &BillingState,
    request: VerifyPaymentRequest,
) -> Result<ActivatedSubscription, ErrorResponse> {
    let order_id = require_text(request.order_id, "orderId")?;
    let payment_id = require_text(request.payment_id, "paymentId")?;
    let signature = require_text(request.signature, "signature")?;
    Ok(billing
        .payments
        .verify_payment(&order_id, &payment_id, &signature)?)
}

/// Current month quota summary
pub fn get_quota_status(
    billing: &BillingState,
    request: UserRequest,
) -> Result<QuotaStatus, ErrorResponse> {
    let user_id = require(request.user_id, "userId")?;
    Ok(billing.quota.quota_status(user_id)?)
}

/// Check if one more interview would be allowed
pub fn check_quota(
    billing: &BillingState,
    request: UserRequest,
) -> Result<QuotaStatus, ErrorResponse> {
    let user_id = require(request.user_id, "userId")?;
    Ok(billing.quota.check_quota(user_id)?)
}

/// Consume one interview if the monthly limit allows it
pub fn check_and_consume_quota(
    billing: &BillingState,
    request: UserRequest,
) -> Result<QuotaStatus, ErrorResponse> {
    let user_id = require(request.user_id, "userId")?;
    Ok(billing.quota.check_and_consume_quota(user_id)?)
}

/// Record a completed interview after an earlier check
pub fn record_usage(
    billing: &BillingState,
    request: UserRequest,
) -> Result<QuotaStatus, ErrorResponse> {
    let user_id = require(request.user_id, "userId")?;
    Ok(billing.quota.record_usage(user_id)?)
}

/// Stored monthly counters for a user
pub fn get_usage_history(
    billing: &BillingState,
    request: UserRequest,
) -> Result<Vec<MonthlyUsage>, ErrorResponse> {
    let user_id = require(request.user_id, "userId")?;
    Ok(billing.usage.history(user_id)?)
}
