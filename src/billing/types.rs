//! Billing data types

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Subscription instance status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    #[default]
    Pending,
    Active,
    Expired,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    /// Allowed status moves
    ///
    /// pending -> active on verified payment, active -> expired on lapse or
    /// supersession, active/expired -> cancelled when a renewal order is
    /// created. Cancelled is terminal.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Active)
                | (Self::Active, Self::Expired)
                | (Self::Active, Self::Cancelled)
                | (Self::Expired, Self::Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Cancelled
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown subscription status '{}'", other)),
        }
    }
}

impl ToSql for SubscriptionStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for SubscriptionStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        text.parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// A purchasable plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: i64,
    pub name: String,
    /// Opaque feature list (text or JSON)
    pub features: String,
    /// Minor currency units, 0 = free
    pub price: i64,
    /// None = unlimited
    pub monthly_limit: Option<u32>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    pub fn is_free(&self) -> bool {
        self.price == 0
    }
}

/// Input for creating a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPlan {
    pub name: String,
    pub features: String,
    pub price: i64,
    #[serde(default)]
    pub monthly_limit: Option<u32>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Partial plan edit; absent fields are left unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanUpdate {
    pub name: Option<String>,
    pub features: Option<String>,
    pub price: Option<i64>,
    /// `Some(None)` clears the limit (unlimited)
    #[serde(default, deserialize_with = "double_option")]
    pub monthly_limit: Option<Option<u32>>,
    pub is_active: Option<bool>,
}

impl PlanUpdate {
    /// Edits allowed once a plan is referenced by subscriptions
    pub fn touches_identity(&self) -> bool {
        self.name.is_some() || self.features.is_some()
    }
}

/// Distinguishes an explicit `null` from a missing field
fn double_option<'de, D, T>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Deserialize::deserialize(de).map(Some)
}

/// One concrete purchase or grant of a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInstance {
    pub id: i64,
    pub user_id: i64,
    pub plan_id: i64,
    /// Gateway order reference, None for free grants
    pub payment_order_id: Option<String>,
    pub payment_id: Option<String>,
    pub amount: i64,
    pub status: SubscriptionStatus,
    pub start_date: Option<DateTime<Utc>>,
    /// None = never expires
    pub end_date: Option<DateTime<Utc>>,
    pub quota_reset_at: Option<DateTime<Utc>>,
    /// Instance that was active when this renewal order was created
    pub renewal_of: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionInstance {
    /// Active with an end date strictly in the past
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active && self.end_date.is_some_and(|end| end < now)
    }
}

/// The user's current usable subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSubscription {
    pub subscription_instance_id: i64,
    pub plan_id: i64,
    pub monthly_limit: Option<u32>,
    pub end_date: Option<DateTime<Utc>>,
}

/// Active instance joined with its plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionDetails {
    pub subscription_instance_id: i64,
    pub plan_id: i64,
    pub name: String,
    pub features: String,
    pub monthly_limit: Option<u32>,
    pub status: SubscriptionStatus,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

/// Order creation request sent to the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderRequest {
    pub amount: i64,
    pub currency: String,
    pub receipt: String,
    pub notes: HashMap<String, String>,
}

/// Order handle returned by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub receipt: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Result of order creation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedOrder {
    pub order: GatewayOrder,
    pub plan: Plan,
    pub subscription_instance_id: i64,
    pub is_renewal: bool,
}

/// Result of a verified payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivatedSubscription {
    pub subscription_instance_id: i64,
    pub plan_id: i64,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Window stacked onto a still-valid previous instance
    pub stacked: bool,
    /// Previously active instance demoted to expired
    pub superseded: Option<i64>,
}

/// Monthly quota summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStatus {
    /// None = unlimited
    pub limit: Option<u32>,
    pub used: u32,
    pub remaining: Option<u32>,
    pub limit_reached: bool,
}

impl QuotaStatus {
    pub fn new(limit: Option<u32>, used: u32) -> Self {
        let remaining = limit.map(|l| l.saturating_sub(used));
        Self {
            limit,
            used,
            remaining,
            limit_reached: remaining == Some(0),
        }
    }
}

/// One stored monthly counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyUsage {
    pub subscription_instance_id: i64,
    pub year: i32,
    pub month: u32,
    pub interview_count: u32,
}

/// Result of a limit check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(tag = "type")]
pub enum LimitCheckResult {
    #[serde(rename = "allowed")]
    Allowed { remaining: Option<u32> },
    #[serde(rename = "denied")]
    Denied { reason: LimitDenialReason },
}

impl LimitCheckResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    pub fn denial_reason(&self) -> Option<&LimitDenialReason> {
        match self {
            Self::Denied { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Reason for denying quota-consuming work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(tag = "type")]
pub enum LimitDenialReason {
    #[serde(rename = "monthlyLimitExceeded")]
    MonthlyLimitExceeded { limit: u32, used: u32 },
    #[serde(rename = "noActiveSubscription")]
    NoActiveSubscription,
}

impl std::fmt::Display for LimitDenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MonthlyLimitExceeded { limit, used } => {
                write!(f, "Monthly interview limit exceeded: {}/{} used", used, limit)
            }
            Self::NoActiveSubscription => write!(f, "No active subscription"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use SubscriptionStatus::*;

        assert!(Pending.can_transition_to(Active));
        assert!(Active.can_transition_to(Expired));
        assert!(Active.can_transition_to(Cancelled));
        assert!(Expired.can_transition_to(Cancelled));

        assert!(!Pending.can_transition_to(Expired));
        assert!(!Pending.can_transition_to(Cancelled));
        assert!(!Expired.can_transition_to(Active));
        assert!(!Cancelled.can_transition_to(Active));
        assert!(!Cancelled.can_transition_to(Expired));
        assert!(Cancelled.is_terminal());
    }

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            SubscriptionStatus::Pending,
            SubscriptionStatus::Active,
            SubscriptionStatus::Expired,
            SubscriptionStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<SubscriptionStatus>(), Ok(status));
        }
        assert!("canceled".parse::<SubscriptionStatus>().is_err());
    }

    #[test]
    fn test_quota_status() {
        let q = QuotaStatus::new(Some(4), 1);
        assert_eq!(q.remaining, Some(3));
        assert!(!q.limit_reached);

        let q = QuotaStatus::new(Some(4), 6);
        assert_eq!(q.remaining, Some(0));
        assert!(q.limit_reached);

        let q = QuotaStatus::new(None, 120);
        assert_eq!(q.remaining, None);
        assert!(!q.limit_reached);
    }

    #[test]
    fn test_plan_update_null_clears_limit() {
        let update: PlanUpdate = serde_json::from_str(r#"{"monthlyLimit": null}"#).unwrap();
        assert_eq!(update.monthly_limit, Some(None));

        let update: PlanUpdate = serde_json::from_str(r#"{"price": 900}"#).unwrap();
        assert_eq!(update.monthly_limit, None);
        assert!(!update.touches_identity());
    }

    #[test]
    fn test_limit_result_serialization() {
        let denied = LimitCheckResult::Denied {
            reason: LimitDenialReason::MonthlyLimitExceeded { limit: 4, used: 4 },
        };
        let json = serde_json::to_value(&denied).unwrap();
        assert_eq!(json["type"], "denied");
        assert_eq!(json["reason"]["type"], "monthlyLimitExceeded");
        assert!(!denied.is_allowed());
    }
}
