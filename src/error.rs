//! Error taxonomy shared by every billing operation

use serde::Serialize;
use thiserror::Error;

/// Errors returned by plan, subscription, payment and quota operations
#[derive(Debug, Error)]
pub enum BillingError {
    /// Missing or malformed input
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Plan or subscription instance absent
    #[error("{0} not found")]
    NotFound(String),

    /// Operation attempted against an instance not in the required status
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Payment signature did not match
    #[error("payment verification failed")]
    VerificationFailed,

    /// Monthly limit reached for the current subscription instance
    #[error("monthly interview limit reached: {used}/{limit} used")]
    QuotaExceeded { limit: u32, used: u32 },

    /// User has no usable subscription and no free plan is available
    #[error("no active subscription")]
    NoActiveSubscription,

    /// Missing or invalid configuration at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Storage, transaction or gateway failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for BillingError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Internal(format!("database: {}", e))
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(e: reqwest::Error) -> Self {
        Self::Internal(format!("payment gateway: {}", e))
    }
}

impl BillingError {
    /// Stable machine-readable code for callers
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "badRequest",
            Self::NotFound(_) => "notFound",
            Self::InvalidState(_) => "invalidState",
            Self::VerificationFailed => "verificationFailed",
            Self::QuotaExceeded { .. } => "quotaExceeded",
            Self::NoActiveSubscription => "noActiveSubscription",
            Self::Config(_) | Self::Internal(_) => "internalError",
        }
    }

    /// Business responses are expected outcomes, not server faults
    pub fn is_business(&self) -> bool {
        !matches!(self, Self::Config(_) | Self::Internal(_))
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

/// Serializable error payload handed to the outer layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used: Option<u32>,
}

impl From<BillingError> for ErrorResponse {
    fn from(err: BillingError) -> Self {
        let (limit, used) = match &err {
            BillingError::QuotaExceeded { limit, used } => (Some(*limit), Some(*used)),
            _ => (None, None),
        };

        // Internal details stay in the logs
        let message = if err.is_business() {
            err.to_string()
        } else {
            tracing::error!(error = %err, "Billing operation failed");
            "Internal server error".to_string()
        };

        Self {
            code: err.code(),
            message,
            limit,
            used,
        }
    }
}
