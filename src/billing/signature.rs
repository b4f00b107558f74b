//! Payment signature verification
//!
//! The gateway signs `"<order_id>|<payment_id>"` with HMAC-SHA256 using the
//! merchant key secret and sends the hex digest back with the payment.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies payment callbacks with the shared secret
#[derive(Clone)]
pub struct PaymentSigner {
    secret: Vec<u8>,
}

impl std::fmt::Debug for PaymentSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentSigner").finish_non_exhaustive()
    }
}

impl PaymentSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac_for(&self, order_id: &str, payment_id: &str) -> BillingResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| BillingError::Internal(format!("invalid signing key: {}", e)))?;
        mac.update(order_id.as_bytes());
        mac.update(b"|");
        mac.update(payment_id.as_bytes());
        Ok(mac)
    }

    /// Hex digest the gateway is expected to send
    pub fn sign(&self, order_id: &str, payment_id: &str) -> BillingResult<String> {
        let mac = self.mac_for(order_id, payment_id)?;
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Constant-time check of a hex signature
    pub fn verify(&self, order_id: &str, payment_id: &str, signature: &str) -> BillingResult<()> {
        let provided =
            hex::decode(signature.trim()).map_err(|_| BillingError::VerificationFailed)?;

        self.mac_for(order_id, payment_id)?
            .verify_slice(&provided)
            .map_err(|_| BillingError::VerificationFailed)
    }
}
