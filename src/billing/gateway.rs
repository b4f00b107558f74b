//! Payment gateway client
//!
//! Orders are created through the `PaymentGateway` trait so reconciliation can
//! run against a fake in tests. The production implementation talks to the
//! Razorpay Orders API over a shared, lazily built HTTP client.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

use super::types::{GatewayOrder, OrderRequest};
use crate::config::GatewayConfig;
use crate::error::{BillingError, BillingResult};

/// Global HTTP client for gateway calls
///
/// Short timeout: order creation is a single round trip and is never retried.
static GATEWAY_CLIENT: Lazy<Option<Client>> = Lazy::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(8)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .map_err(|e| tracing::error!("Failed to create gateway HTTP client: {}", e))
        .ok()
});

fn gateway_client() -> BillingResult<&'static Client> {
    GATEWAY_CLIENT
        .as_ref()
        .ok_or_else(|| BillingError::Internal("gateway HTTP client unavailable".to_string()))
}

/// External order creation
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(&self, request: &OrderRequest) -> BillingResult<GatewayOrder>;
}

/// Razorpay Orders API
pub struct RazorpayGateway {
    config: GatewayConfig,
}

impl RazorpayGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    fn orders_url(&self) -> String {
        format!("{}/v1/orders", self.config.base_url)
    }
}

#[async_trait]
impl PaymentGateway for RazorpayGateway {
    async fn create_order(&self, request: &OrderRequest) -> BillingResult<GatewayOrder> {
        let resp = gateway_client()?
            .post(self.orders_url())
            .basic_auth(&self.config.key_id, Some(&self.config.key_secret))
            .json(request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(%status, receipt = %request.receipt, "Gateway rejected order");
            return Err(BillingError::Internal(format!(
                "gateway order creation failed ({}): {}",
                status, text
            )));
        }

        let order: GatewayOrder = resp.json().await?;
        debug!(order_id = %order.id, amount = order.amount, "Gateway order created");
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_client_is_shared() {
        let a = gateway_client().unwrap();
        let b = gateway_client().unwrap();
        assert!(std::ptr::eq(a, b));
    }

    #[test]
    fn test_orders_url() {
        let gateway = RazorpayGateway::new(GatewayConfig {
            key_id: "rzp_test".to_string(),
            key_secret: "secret".to_string(),
            base_url: "https://api.razorpay.com".to_string(),
        });
        assert_eq!(gateway.orders_url(), "https://api.razorpay.com/v1/orders");
    }

    #[test]
    fn test_order_wire_format() {
        let mut notes = HashMap::new();
        notes.insert("is_renewal".to_string(), "false".to_string());
        let request = OrderRequest {
            amount: 50_000,
            currency: "INR".to_string(),
            receipt: "sub_abc".to_string(),
            notes,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["amount"], 50_000);
        assert_eq!(json["notes"]["is_renewal"], "false");

        let order: GatewayOrder = serde_json::from_str(
            r#"{"id":"order_9A33XWu170gUtm","entity":"order","amount":50000,
                "currency":"INR","receipt":"sub_abc","status":"created","attempts":0}"#,
        )
        .unwrap();
        assert_eq!(order.id, "order_9A33XWu170gUtm");
        assert_eq!(order.status.as_deref(), Some("created"));
    }
}
