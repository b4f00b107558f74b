//! Subscription lifecycle resolution
//!
//! Resolves the user's current usable subscription. Reading is allowed to
//! write: a lapsed instance is expired on sight, and a user with nothing
//! active is granted the free plan.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tracing::{debug, info};

use super::plans::find_free_plan;
use super::store::{
    find_instance, find_plan, instance_from_row, transition_now, Database, INSTANCE_COLUMNS,
};
use super::types::{ActiveSubscription, SubscriptionDetails, SubscriptionInstance, SubscriptionStatus};
use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};

/// Subscription resolver and history queries
pub struct SubscriptionManager {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl SubscriptionManager {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Current usable subscription, provisioning the free plan if needed
    ///
    /// Returns `None` only when the user has nothing active and no active
    /// free plan exists. Safe to call repeatedly.
    pub fn get_active_subscription(&self, user_id: i64) -> BillingResult<Option<ActiveSubscription>> {
        let mut conn = self.db.lock();
        resolve_active(&mut conn, user_id, self.clock.now())
    }

    /// Like [`Self::get_active_subscription`] but absence is an error
    pub fn require_active_subscription(&self, user_id: i64) -> BillingResult<ActiveSubscription> {
        self.get_active_subscription(user_id)?
            .ok_or(BillingError::NoActiveSubscription)
    }

    /// Preferred active instance joined with its plan
    pub fn subscription_details(&self, user_id: i64) -> BillingResult<Option<SubscriptionDetails>> {
        let mut conn = self.db.lock();
        resolve_active(&mut conn, user_id, self.clock.now())?;

        // Paid plans win over the free grant, then newest first
        let details = conn
            .query_row(
                "SELECT us.id, us.plan_id, p.name, p.features, p.monthly_limit,
                        us.status, us.start_date, us.end_date
                 FROM user_subscriptions us
                 JOIN plans p ON p.id = us.plan_id
                 WHERE us.user_id = ?1 AND us.status = 'active'
                 ORDER BY CASE WHEN p.price > 0 THEN 0 ELSE 1 END,
                          us.created_at DESC, us.id DESC
                 LIMIT 1",
                params![user_id],
                |row| {
                    Ok(SubscriptionDetails {
                        subscription_instance_id: row.get(0)?,
                        plan_id: row.get(1)?,
                        name: row.get(2)?,
                        features: row.get(3)?,
                        monthly_limit: row.get(4)?,
                        status: row.get(5)?,
                        start_date: row.get(6)?,
                        end_date: row.get(7)?,
                    })
                },
            )
            .optional()?;

        Ok(details)
    }

    /// Every instance for a user, newest first
    pub fn list_user_subscriptions(&self, user_id: i64) -> BillingResult<Vec<SubscriptionInstance>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM user_subscriptions
             WHERE user_id = ?1 ORDER BY id DESC"
        ))?;
        let rows = stmt
            .query_map(params![user_id], instance_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_instance(&self, instance_id: i64) -> BillingResult<SubscriptionInstance> {
        let conn = self.db.lock();
        find_instance(&conn, instance_id)?
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", instance_id)))
    }
}

/// Resolve the user's usable subscription on an already-locked connection
pub(crate) fn resolve_active(
    conn: &mut Connection,
    user_id: i64,
    now: DateTime<Utc>,
) -> BillingResult<Option<ActiveSubscription>> {
    // Each pass either returns or expires one lapsed row
    while let Some(instance) = latest_active(conn, user_id)? {
        if instance.is_lapsed(now) {
            transition_now(
                conn,
                instance.id,
                SubscriptionStatus::Active,
                SubscriptionStatus::Expired,
                now,
            )?;
            info!(
                user_id,
                instance_id = instance.id,
                end_date = ?instance.end_date,
                "Subscription expired"
            );
            continue;
        }

        let plan = find_plan(conn, instance.plan_id)?
            .ok_or_else(|| BillingError::NotFound(format!("plan {}", instance.plan_id)))?;

        debug!(user_id, instance_id = instance.id, plan_id = plan.id, "Resolved active subscription");
        return Ok(Some(ActiveSubscription {
            subscription_instance_id: instance.id,
            plan_id: plan.id,
            monthly_limit: plan.monthly_limit,
            end_date: instance.end_date,
        }));
    }

    provision_free(conn, user_id, now)
}

fn latest_active(conn: &Connection, user_id: i64) -> BillingResult<Option<SubscriptionInstance>> {
    let instance = conn
        .query_row(
            &format!(
                "SELECT {INSTANCE_COLUMNS} FROM user_subscriptions
                 WHERE user_id = ?1 AND status = 'active'
                 ORDER BY id DESC LIMIT 1"
            ),
            params![user_id],
            instance_from_row,
        )
        .optional()?;
    Ok(instance)
}

/// Grant the free plan; a concurrent grant wins and is re-read
fn provision_free(
    conn: &Connection,
    user_id: i64,
    now: DateTime<Utc>,
) -> BillingResult<Option<ActiveSubscription>> {
    let Some(plan) = find_free_plan(conn)? else {
        debug!(user_id, "No active free plan to provision");
        return Ok(None);
    };

    let inserted = conn.execute(
        "INSERT INTO user_subscriptions
             (user_id, plan_id, amount, status, start_date, end_date, quota_reset_at,
              created_at, updated_at)
         VALUES (?1, ?2, 0, 'active', ?3, NULL, ?3, ?3, ?3)
         ON CONFLICT DO NOTHING",
        params![user_id, plan.id, now],
    )?;

    let instance = if inserted == 1 {
        let id = conn.last_insert_rowid();
        info!(user_id, instance_id = id, plan_id = plan.id, "Provisioned free plan");
        find_instance(conn, id)?
    } else {
        debug!(user_id, plan_id = plan.id, "Free plan already granted, re-reading");
        conn.query_row(
            &format!(
                "SELECT {INSTANCE_COLUMNS} FROM user_subscriptions
                 WHERE user_id = ?1 AND plan_id = ?2 AND status = 'active'"
            ),
            params![user_id, plan.id],
            instance_from_row,
        )
        .optional()?
    };

    let instance = instance.ok_or_else(|| {
        BillingError::Internal(format!("free plan grant for user {} vanished", user_id))
    })?;

    Ok(Some(ActiveSubscription {
        subscription_instance_id: instance.id,
        plan_id: plan.id,
        monthly_limit: plan.monthly_limit,
        end_date: instance.end_date,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::plans::PlanCatalog;
    use crate::testing::{fixed_clock, insert_instance_row, new_plan};
    use chrono::Duration;
    use std::thread;

    struct Fixture {
        db: Arc<Database>,
        clock: Arc<crate::clock::FixedClock>,
        catalog: PlanCatalog,
        manager: SubscriptionManager,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let clock = fixed_clock();
        Fixture {
            catalog: PlanCatalog::new(db.clone(), clock.clone()),
            manager: SubscriptionManager::new(db.clone(), clock.clone()),
            db,
            clock,
        }
    }

    #[test]
    fn test_first_access_provisions_free_plan_once() {
        let f = fixture();
        let free = f.catalog.create_plan(new_plan("Free", 0, Some(4))).unwrap();

        let first = f.manager.get_active_subscription(1).unwrap().unwrap();
        assert_eq!(first.plan_id, free.id);
        assert_eq!(first.monthly_limit, Some(4));
        assert_eq!(first.end_date, None);

        let second = f.manager.get_active_subscription(1).unwrap().unwrap();
        assert_eq!(second, first);

        let history = f.manager.list_user_subscriptions(1).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, SubscriptionStatus::Active);
        assert_eq!(history[0].payment_order_id, None);
        assert_eq!(history[0].start_date, Some(f.clock.now()));
        assert_eq!(history[0].quota_reset_at, Some(f.clock.now()));
    }

    #[test]
    fn test_concurrent_first_access_shares_instance() {
        let f = fixture();
        f.catalog.create_plan(new_plan("Free", 0, Some(4))).unwrap();
        let manager = Arc::new(f.manager);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                thread::spawn(move || manager.get_active_subscription(9).unwrap().unwrap())
            })
            .collect();

        let ids: Vec<i64> = handles
            .into_iter()
            .map(|h| h.join().unwrap().subscription_instance_id)
            .collect();
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(manager.list_user_subscriptions(9).unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_grant_rereads_existing() {
        let f = fixture();
        f.catalog.create_plan(new_plan("Free", 0, Some(4))).unwrap();

        let conn = f.db.lock();
        let now = f.clock.now();
        let winner = provision_free(&conn, 3, now).unwrap().unwrap();
        let loser = provision_free(&conn, 3, now).unwrap().unwrap();
        assert_eq!(winner, loser);
    }

    #[test]
    fn test_no_free_plan_yields_none() {
        let f = fixture();
        f.catalog.create_plan(new_plan("Pro", 500, Some(20))).unwrap();

        assert_eq!(f.manager.get_active_subscription(1).unwrap(), None);
        assert!(matches!(
            f.manager.require_active_subscription(1),
            Err(BillingError::NoActiveSubscription)
        ));
        assert!(f.manager.list_user_subscriptions(1).unwrap().is_empty());
    }

    #[test]
    fn test_lapsed_instance_expires_and_falls_back_to_free() {
        let f = fixture();
        let free = f.catalog.create_plan(new_plan("Free", 0, Some(4))).unwrap();
        let pro = f.catalog.create_plan(new_plan("Pro", 500, Some(20))).unwrap();

        let now = f.clock.now();
        let paid = insert_instance_row(
            &f.db,
            1,
            pro.id,
            SubscriptionStatus::Active,
            Some(now - Duration::days(40)),
            Some(now - Duration::days(10)),
        );

        let resolved = f.manager.get_active_subscription(1).unwrap().unwrap();
        assert_eq!(resolved.plan_id, free.id);
        assert_ne!(resolved.subscription_instance_id, paid);

        let expired = f.manager.get_instance(paid).unwrap();
        assert_eq!(expired.status, SubscriptionStatus::Expired);
    }

    #[test]
    fn test_lapsed_without_free_plan_yields_none() {
        let f = fixture();
        let pro = f.catalog.create_plan(new_plan("Pro", 500, Some(20))).unwrap();
        let now = f.clock.now();
        let paid = insert_instance_row(
            &f.db,
            1,
            pro.id,
            SubscriptionStatus::Active,
            Some(now - Duration::days(31)),
            Some(now - Duration::seconds(1)),
        );

        assert_eq!(f.manager.get_active_subscription(1).unwrap(), None);
        assert_eq!(
            f.manager.get_instance(paid).unwrap().status,
            SubscriptionStatus::Expired
        );
    }

    #[test]
    fn test_end_date_equal_to_now_is_still_valid() {
        let f = fixture();
        let pro = f.catalog.create_plan(new_plan("Pro", 500, Some(20))).unwrap();
        let now = f.clock.now();
        let paid = insert_instance_row(
            &f.db,
            1,
            pro.id,
            SubscriptionStatus::Active,
            Some(now - Duration::days(30)),
            Some(now),
        );

        let resolved = f.manager.get_active_subscription(1).unwrap().unwrap();
        assert_eq!(resolved.subscription_instance_id, paid);
    }

    #[test]
    fn test_details_prefer_paid_plan() {
        let f = fixture();
        f.catalog.create_plan(new_plan("Free", 0, Some(4))).unwrap();
        let pro = f.catalog.create_plan(new_plan("Pro", 500, None)).unwrap();

        // Free grant first, then a paid instance
        f.manager.get_active_subscription(1).unwrap();
        let now = f.clock.now();
        insert_instance_row(
            &f.db,
            1,
            pro.id,
            SubscriptionStatus::Active,
            Some(now),
            Some(now + Duration::days(30)),
        );

        let details = f.manager.subscription_details(1).unwrap().unwrap();
        assert_eq!(details.plan_id, pro.id);
        assert_eq!(details.name, "Pro");
        assert_eq!(details.monthly_limit, None);
        assert_eq!(details.status, SubscriptionStatus::Active);
    }

    #[test]
    fn test_limit_edits_apply_to_future_reads() {
        let f = fixture();
        let free = f.catalog.create_plan(new_plan("Free", 0, Some(4))).unwrap();
        f.manager.get_active_subscription(1).unwrap();

        f.catalog
            .update_plan(
                free.id,
                crate::billing::types::PlanUpdate {
                    monthly_limit: Some(Some(2)),
                    ..Default::default()
                },
            )
            .unwrap();

        let resolved = f.manager.get_active_subscription(1).unwrap().unwrap();
        assert_eq!(resolved.monthly_limit, Some(2));
    }
}
