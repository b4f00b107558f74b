//! Environment-driven configuration

use std::path::PathBuf;

use crate::error::{BillingError, BillingResult};

const DEFAULT_GATEWAY_URL: &str = "https://api.razorpay.com";
const DEFAULT_CURRENCY: &str = "INR";
/// Limit reported to users who have no subscription at all
const DEFAULT_MONTHLY_LIMIT: u32 = 4;

/// Payment gateway credentials
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub key_id: String,
    /// Also the HMAC key for payment signatures
    pub key_secret: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub database_path: PathBuf,
    pub gateway: GatewayConfig,
    pub currency: String,
    pub default_monthly_limit: u32,
}

impl BillingConfig {
    /// Load `.env` (if any) and read configuration from the environment
    pub fn from_env() -> BillingResult<Self> {
        // Check current dir first, then the parent (running from a subdirectory)
        if dotenvy::dotenv().is_err() {
            let _ = dotenvy::from_path("../.env");
        }

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> BillingResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| BillingError::Config(format!("{} is not set", key)))
        };

        let database_path = match lookup("BILLING_DATABASE_PATH") {
            Some(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => default_database_path()?,
        };

        let default_monthly_limit = match lookup("BILLING_DEFAULT_MONTHLY_LIMIT") {
            Some(raw) => raw.trim().parse::<u32>().map_err(|e| {
                BillingError::Config(format!(
                    "BILLING_DEFAULT_MONTHLY_LIMIT must be a non-negative integer: {}",
                    e
                ))
            })?,
            None => DEFAULT_MONTHLY_LIMIT,
        };

        Ok(Self {
            database_path,
            gateway: GatewayConfig {
                key_id: required("RAZORPAY_KEY_ID")?,
                key_secret: required("RAZORPAY_KEY_SECRET")?,
                base_url: lookup("RAZORPAY_BASE_URL")
                    .map(|u| u.trim_end_matches('/').to_string())
                    .unwrap_or_else(|| DEFAULT_GATEWAY_URL.to_string()),
            },
            currency: lookup("BILLING_CURRENCY").unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            default_monthly_limit,
        })
    }
}

fn default_database_path() -> BillingResult<PathBuf> {
    dirs::data_dir()
        .map(|d| d.join("interview-billing").join("billing.db"))
        .ok_or_else(|| BillingError::Config("Could not determine data directory".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_applied() {
        let config = BillingConfig::from_lookup(lookup_from(&[
            ("BILLING_DATABASE_PATH", "/tmp/billing.db"),
            ("RAZORPAY_KEY_ID", "rzp_test_key"),
            ("RAZORPAY_KEY_SECRET", "secret"),
        ]))
        .unwrap();

        assert_eq!(config.database_path, PathBuf::from("/tmp/billing.db"));
        assert_eq!(config.gateway.base_url, "https://api.razorpay.com");
        assert_eq!(config.currency, "INR");
        assert_eq!(config.default_monthly_limit, 4);
    }

    #[test]
    fn test_missing_secret_rejected() {
        let result = BillingConfig::from_lookup(lookup_from(&[
            ("BILLING_DATABASE_PATH", "/tmp/billing.db"),
            ("RAZORPAY_KEY_ID", "rzp_test_key"),
            ("RAZORPAY_KEY_SECRET", "  "),
        ]));
        assert!(matches!(result, Err(BillingError::Config(msg)) if msg.contains("RAZORPAY_KEY_SECRET")));
    }

    #[test]
    fn test_overrides() {
        let config = BillingConfig::from_lookup(lookup_from(&[
            ("BILLING_DATABASE_PATH", "/tmp/billing.db"),
            ("RAZORPAY_KEY_ID", "rzp_test_key"),
            ("RAZORPAY_KEY_SECRET", "secret"),
            ("RAZORPAY_BASE_URL", "http://localhost:9000/"),
            ("BILLING_CURRENCY", "USD"),
            ("BILLING_DEFAULT_MONTHLY_LIMIT", "10"),
        ]))
        .unwrap();

        assert_eq!(config.gateway.base_url, "http://localhost:9000");
        assert_eq!(config.currency, "USD");
        assert_eq!(config.default_monthly_limit, 10);

        let bad = BillingConfig::from_lookup(lookup_from(&[
            ("RAZORPAY_KEY_ID", "k"),
            ("RAZORPAY_KEY_SECRET", "s"),
            ("BILLING_DATABASE_PATH", "/tmp/b.db"),
            ("BILLING_DEFAULT_MONTHLY_LIMIT", "many"),
        ]));
        assert!(matches!(bad, Err(BillingError::Config(_))));
    }
}
