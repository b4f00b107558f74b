//! Plan catalog
//!
//! Administrative CRUD over purchasable plans plus the free-plan lookup used
//! by the subscription resolver.

use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tracing::info;

use super::store::{find_plan, plan_from_row, Database, PLAN_COLUMNS};
use super::types::{NewPlan, Plan, PlanUpdate};
use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};

pub struct PlanCatalog {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl PlanCatalog {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    pub fn create_plan(&self, new: NewPlan) -> BillingResult<Plan> {
        validate_text("name", &new.name)?;
        validate_text("features", &new.features)?;
        validate_price(new.price)?;

        let conn = self.db.lock();
        let now = self.clock.now();
        conn.execute(
            "INSERT INTO plans (name, features, price, monthly_limit, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                new.name.trim(),
                new.features,
                new.price,
                new.monthly_limit,
                new.is_active,
                now
            ],
        )?;
        let id = conn.last_insert_rowid();

        info!(plan_id = id, price = new.price, limit = ?new.monthly_limit, "Created plan");
        find_plan(&conn, id)?.ok_or_else(|| BillingError::NotFound(format!("plan {}", id)))
    }

    /// All plans, oldest first
    pub fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        let conn = self.db.lock();
        query_plans(&conn, "")
    }

    pub fn list_active_plans(&self) -> BillingResult<Vec<Plan>> {
        let conn = self.db.lock();
        query_plans(&conn, "WHERE is_active = 1")
    }

    pub fn get_plan(&self, plan_id: i64) -> BillingResult<Plan> {
        let conn = self.db.lock();
        find_plan(&conn, plan_id)?.ok_or_else(|| BillingError::NotFound(format!("plan {}", plan_id)))
    }

    /// Apply a partial edit
    ///
    /// Once a plan backs any subscription instance only price, monthly limit
    /// and the active flag may change. Existing instances keep their paid
    /// amount and stored usage counts.
    pub fn update_plan(&self, plan_id: i64, update: PlanUpdate) -> BillingResult<Plan> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let mut plan = find_plan(&tx, plan_id)?
            .ok_or_else(|| BillingError::NotFound(format!("plan {}", plan_id)))?;

        if update.touches_identity() && is_referenced(&tx, plan_id)? {
            return Err(BillingError::InvalidState(format!(
                "plan {} is referenced by subscriptions; only price, limit and active flag can change",
                plan_id
            )));
        }

        if let Some(name) = update.name {
            validate_text("name", &name)?;
            plan.name = name.trim().to_string();
        }
        if let Some(features) = update.features {
            validate_text("features", &features)?;
            plan.features = features;
        }
        if let Some(price) = update.price {
            validate_price(price)?;
            plan.price = price;
        }
        if let Some(limit) = update.monthly_limit {
            plan.monthly_limit = limit;
        }
        if let Some(active) = update.is_active {
            plan.is_active = active;
        }
        plan.updated_at = self.clock.now();

        tx.execute(
            "UPDATE plans SET name = ?1, features = ?2, price = ?3, monthly_limit = ?4,
                              is_active = ?5, updated_at = ?6
             WHERE id = ?7",
            params![
                plan.name,
                plan.features,
                plan.price,
                plan.monthly_limit,
                plan.is_active,
                plan.updated_at,
                plan_id
            ],
        )?;
        tx.commit()?;

        info!(plan_id, price = plan.price, active = plan.is_active, "Updated plan");
        Ok(plan)
    }

    pub fn delete_plan(&self, plan_id: i64) -> BillingResult<()> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        if is_referenced(&tx, plan_id)? {
            return Err(BillingError::InvalidState(format!(
                "plan {} is referenced by subscriptions; deactivate it instead",
                plan_id
            )));
        }

        let deleted = tx.execute("DELETE FROM plans WHERE id = ?1", params![plan_id])?;
        if deleted == 0 {
            return Err(BillingError::NotFound(format!("plan {}", plan_id)));
        }
        tx.commit()?;

        info!(plan_id, "Deleted plan");
        Ok(())
    }

    /// The active free tier, if one is configured
    pub fn free_plan(&self) -> BillingResult<Option<Plan>> {
        let conn = self.db.lock();
        find_free_plan(&conn)
    }
}

/// Lowest-id plan with price 0 that is active
pub(crate) fn find_free_plan(conn: &Connection) -> BillingResult<Option<Plan>> {
    let plan = conn
        .query_row(
            &format!(
                "SELECT {PLAN_COLUMNS} FROM plans WHERE price = 0 AND is_active = 1
                 ORDER BY id ASC LIMIT 1"
            ),
            [],
            plan_from_row,
        )
        .optional()?;
    Ok(plan)
}

fn is_referenced(conn: &Connection, plan_id: i64) -> BillingResult<bool> {
    let referenced = conn
        .query_row(
            "SELECT 1 FROM user_subscriptions WHERE plan_id = ?1 LIMIT 1",
            params![plan_id],
            |_| Ok(true),
        )
        .optional()?
        .unwrap_or(false);
    Ok(referenced)
}

fn query_plans(conn: &Connection, filter: &str) -> BillingResult<Vec<Plan>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PLAN_COLUMNS} FROM plans {filter} ORDER BY id ASC"
    ))?;
    let plans = stmt
        .query_map([], plan_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(plans)
}

fn validate_text(field: &str, value: &str) -> BillingResult<()> {
    if value.trim().is_empty() {
        return Err(BillingError::BadRequest(format!("{} is required", field)));
    }
    Ok(())
}

fn validate_price(price: i64) -> BillingResult<()> {
    if price < 0 {
        return Err(BillingError::BadRequest("price cannot be negative".to_string()));
    }
    Ok(())
}
