//! Payment reconciliation
//!
//! Turns a gateway order into an active subscription instance:
//! - order creation cancels the user's current instance of the same plan
//!   (renewal) and inserts a `pending` row carrying the order reference
//! - verification checks the payment signature, computes the new validity
//!   window and, in one transaction, demotes the previous active instance
//!   and activates the pending one

use chrono::{DateTime, Months, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::gateway::PaymentGateway;
use super::signature::PaymentSigner;
use super::store::{
    find_instance, find_plan, instance_from_row, transition, Database, INSTANCE_COLUMNS,
};
use super::types::{
    ActivatedSubscription, CreatedOrder, OrderRequest, SubscriptionInstance, SubscriptionStatus,
};
use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};

pub struct PaymentReconciler {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    gateway: Arc<dyn PaymentGateway>,
    signer: PaymentSigner,
    currency: String,
}

impl PaymentReconciler {
    pub fn new(
        db: Arc<Database>,
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn PaymentGateway>,
        signer: PaymentSigner,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            db,
            clock,
            gateway,
            signer,
            currency: currency.into(),
        }
    }

    /// Create a gateway order and the matching pending instance
    ///
    /// Not idempotent: every call creates a new gateway order. Callers that
    /// retry should look for an existing order with [`Self::find_pending_order`]
    /// first.
    pub async fn create_order(&self, user_id: i64, plan_id: i64) -> BillingResult<CreatedOrder> {
        let (plan, is_renewal) = {
            let conn = self.db.lock();
            let plan = find_plan(&conn, plan_id)?
                .filter(|p| p.is_active)
                .ok_or_else(|| BillingError::NotFound(format!("plan {}", plan_id)))?;

            if plan.is_free() {
                return Err(BillingError::BadRequest(
                    "free plan does not require payment".to_string(),
                ));
            }

            let is_renewal = !renewal_candidates(&conn, user_id, plan_id)?.is_empty();
            (plan, is_renewal)
        };

        let mut notes = HashMap::new();
        notes.insert("user_id".to_string(), user_id.to_string());
        notes.insert("plan_id".to_string(), plan_id.to_string());
        notes.insert("is_renewal".to_string(), is_renewal.to_string());

        let request = OrderRequest {
            amount: plan.price,
            currency: self.currency.clone(),
            receipt: format!("sub_{}", Uuid::new_v4().simple()),
            notes,
        };

        // Single attempt; nothing has been written yet if this fails
        let order = self.gateway.create_order(&request).await?;

        let (instance_id, cancelled) = {
            let mut conn = self.db.lock();
            let now = self.clock.now();
            let tx = conn.transaction()?;

            // Re-read: the lazy expiry may have moved rows since the first look
            let superseded = renewal_candidates(&tx, user_id, plan_id)?;
            let renewal_of = superseded
                .iter()
                .filter(|i| i.status == SubscriptionStatus::Active)
                .map(|i| i.id)
                .max();

            for instance in &superseded {
                transition(&tx, instance.id, instance.status, SubscriptionStatus::Cancelled, now)?;
            }

            tx.execute(
                "INSERT INTO user_subscriptions
                     (user_id, plan_id, payment_order_id, amount, status, renewal_of,
                      created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    user_id,
                    plan_id,
                    order.id,
                    plan.price,
                    SubscriptionStatus::Pending,
                    renewal_of,
                    now
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;

            if !superseded.is_empty() {
                debug!(user_id, plan_id, cancelled = superseded.len(), "Cancelled superseded instances");
            }
            (id, superseded.len())
        };

        // The flag reflects what was actually cancelled, not the first look
        let noted_renewal = is_renewal;
        let is_renewal = cancelled > 0;
        if is_renewal != noted_renewal {
            warn!(
                user_id,
                plan_id,
                order_id = %order.id,
                noted_renewal,
                is_renewal,
                "Renewal status changed while the gateway order was created"
            );
        }

        info!(
            user_id,
            plan_id,
            instance_id,
            order_id = %order.id,
            is_renewal,
            "Created subscription order"
        );

        Ok(CreatedOrder {
            order,
            plan,
            subscription_instance_id: instance_id,
            is_renewal,
        })
    }

    /// Verify a payment and activate the pending instance
    pub fn verify_payment(
        &self,
        order_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> BillingResult<ActivatedSubscription> {
        if order_id.trim().is_empty() || payment_id.trim().is_empty() || signature.trim().is_empty() {
            return Err(BillingError::BadRequest("missing payment details".to_string()));
        }

        let mut conn = self.db.lock();
        let now = self.clock.now();
        let tx = conn.transaction()?;

        let pending = find_by_order(&tx, order_id)?
            .filter(|i| i.status == SubscriptionStatus::Pending)
            .ok_or_else(|| {
                BillingError::InvalidState(format!("order {} has no pending subscription", order_id))
            })?;

        if let Err(e) = self.signer.verify(order_id, payment_id, signature) {
            warn!(order_id, user_id = pending.user_id, "Payment signature mismatch");
            return Err(e);
        }

        let previous_active = active_instance(&tx, pending.user_id, pending.plan_id)?;
        let renewed_from = match pending.renewal_of {
            Some(id) => find_instance(&tx, id)?,
            None => None,
        };

        let anchor = latest_valid_end(
            [previous_active.as_ref(), renewed_from.as_ref()],
            now,
        );
        let (start_date, end_date) = validity_window(now, anchor)?;

        // Demote before promoting so the one-active-per-plan index never sees two
        if let Some(previous) = &previous_active {
            transition(
                &tx,
                previous.id,
                SubscriptionStatus::Active,
                SubscriptionStatus::Expired,
                now,
            )?;
        }

        if !transition(
            &tx,
            pending.id,
            SubscriptionStatus::Pending,
            SubscriptionStatus::Active,
            now,
        )? {
            return Err(BillingError::InvalidState(format!(
                "order {} is no longer pending",
                order_id
            )));
        }

        tx.execute(
            "UPDATE user_subscriptions
             SET payment_id = ?1, start_date = ?2, end_date = ?3, quota_reset_at = ?2,
                 updated_at = ?4
             WHERE id = ?5",
            params![payment_id, start_date, end_date, now, pending.id],
        )?;
        tx.commit()?;

        info!(
            user_id = pending.user_id,
            plan_id = pending.plan_id,
            instance_id = pending.id,
            %start_date,
            %end_date,
            stacked = anchor.is_some(),
            "Subscription activated"
        );

        Ok(ActivatedSubscription {
            subscription_instance_id: pending.id,
            plan_id: pending.plan_id,
            start_date,
            end_date,
            stacked: anchor.is_some(),
            superseded: previous_active.map(|p| p.id),
        })
    }

    /// Newest pending order for (user, plan), if any
    pub fn find_pending_order(
        &self,
        user_id: i64,
        plan_id: i64,
    ) -> BillingResult<Option<SubscriptionInstance>> {
        let conn = self.db.lock();
        let instance = conn
            .query_row(
                &format!(
                    "SELECT {INSTANCE_COLUMNS} FROM user_subscriptions
                     WHERE user_id = ?1 AND plan_id = ?2 AND status = 'pending'
                     ORDER BY id DESC LIMIT 1"
                ),
                params![user_id, plan_id],
                instance_from_row,
            )
            .optional()?;
        Ok(instance)
    }
}

/// New window: stacked onto `anchor` when given, else starting now
pub fn validity_window(
    now: DateTime<Utc>,
    anchor: Option<DateTime<Utc>>,
) -> BillingResult<(DateTime<Utc>, DateTime<Utc>)> {
    let start = match anchor {
        Some(end) if end > now => end,
        _ => now,
    };
    let end = start
        .checked_add_months(Months::new(1))
        .ok_or_else(|| BillingError::Internal(format!("cannot add one month to {}", start)))?;
    Ok((start, end))
}

/// Latest end date strictly after `now` among the candidates
fn latest_valid_end<'a, I>(candidates: I, now: DateTime<Utc>) -> Option<DateTime<Utc>>
where
    I: IntoIterator<Item = Option<&'a SubscriptionInstance>>,
{
    candidates
        .into_iter()
        .flatten()
        .filter_map(|i| i.end_date)
        .filter(|end| *end > now)
        .max()
}

/// Active or expired instances of the same plan, i.e. what a new order renews
fn renewal_candidates(
    conn: &Connection,
    user_id: i64,
    plan_id: i64,
) -> BillingResult<Vec<SubscriptionInstance>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM user_subscriptions
         WHERE user_id = ?1 AND plan_id = ?2 AND status IN ('active', 'expired')
         ORDER BY id ASC"
    ))?;
    let rows = stmt
        .query_map(params![user_id, plan_id], instance_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn active_instance(
    conn: &Connection,
    user_id: i64,
    plan_id: i64,
) -> BillingResult<Option<SubscriptionInstance>> {
    let instance = conn
        .query_row(
            &format!(
                "SELECT {INSTANCE_COLUMNS} FROM user_subscriptions
                 WHERE user_id = ?1 AND plan_id = ?2 AND status = 'active'
                 ORDER BY end_date DESC LIMIT 1"
            ),
            params![user_id, plan_id],
            instance_from_row,
        )
        .optional()?;
    Ok(instance)
}

fn find_by_order(conn: &Connection, order_id: &str) -> BillingResult<Option<SubscriptionInstance>> {
    let instance = conn
        .query_row(
            &format!("SELECT {INSTANCE_COLUMNS} FROM user_subscriptions WHERE payment_order_id = ?1"),
            params![order_id],
            instance_from_row,
        )
        .optional()?;
    Ok(instance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_window_fresh_purchase() {
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 8, 30, 0).unwrap();
        let (start, end) = validity_window(now, None).unwrap();
        assert_eq!(start, now);
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 4, 10, 8, 30, 0).unwrap());
    }

    #[test]
    fn test_window_stacks_on_future_end() {
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap();
        let prior_end = Utc.with_ymd_and_hms(2025, 3, 25, 12, 0, 0).unwrap();
        let (start, end) = validity_window(now, Some(prior_end)).unwrap();
        assert_eq!(start, prior_end);
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 4, 25, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_window_ignores_past_end() {
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap();
        let prior_end = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let (start, _) = validity_window(now, Some(prior_end)).unwrap();
        assert_eq!(start, now);
    }

    #[test]
    fn test_window_month_end_clamps() {
        let jan31 = Utc.with_ymd_and_hms(2025, 1, 31, 9, 0, 0).unwrap();
        let (_, end) = validity_window(jan31, None).unwrap();
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 2, 28, 9, 0, 0).unwrap());

        let leap = Utc.with_ymd_and_hms(2024, 1, 31, 9, 0, 0).unwrap();
        let (_, end) = validity_window(leap, None).unwrap();
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 2, 29, 9, 0, 0).unwrap());
    }
}
