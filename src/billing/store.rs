//! SQLite-backed store for plans, subscription instances and usage counters
//!
//! A single connection sits behind a mutex; every public billing operation
//! takes the lock once, so reads and the writes that depend on them are not
//! interleaved with other requests on the same store.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use super::types::{Plan, SubscriptionInstance, SubscriptionStatus};
use crate::error::{BillingError, BillingResult};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS plans (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    name           TEXT NOT NULL,
    features       TEXT NOT NULL,
    price          INTEGER NOT NULL CHECK (price >= 0),
    monthly_limit  INTEGER,
    is_active      INTEGER NOT NULL DEFAULT 1,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_subscriptions (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id           INTEGER NOT NULL,
    plan_id           INTEGER NOT NULL REFERENCES plans(id),
    payment_order_id  TEXT UNIQUE,
    payment_id        TEXT,
    amount            INTEGER NOT NULL DEFAULT 0,
    status            TEXT NOT NULL
                      CHECK (status IN ('pending', 'active', 'expired', 'cancelled')),
    start_date        TEXT,
    end_date          TEXT,
    quota_reset_at    TEXT,
    renewal_of        INTEGER REFERENCES user_subscriptions(id),
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_one_active_per_plan
    ON user_subscriptions(user_id, plan_id) WHERE status = 'active';

CREATE INDEX IF NOT EXISTS idx_subscriptions_user
    ON user_subscriptions(user_id, status, id DESC);

CREATE TABLE IF NOT EXISTS user_monthly_usage (
    user_id                   INTEGER NOT NULL,
    subscription_instance_id  INTEGER NOT NULL REFERENCES user_subscriptions(id),
    year                      INTEGER NOT NULL,
    month                     INTEGER NOT NULL CHECK (month BETWEEN 1 AND 12),
    interview_count           INTEGER NOT NULL DEFAULT 0,
    created_at                TEXT NOT NULL,
    updated_at                TEXT NOT NULL,
    PRIMARY KEY (user_id, subscription_instance_id, year, month)
);
"#;

pub(crate) const PLAN_COLUMNS: &str =
    "id, name, features, price, monthly_limit, is_active, created_at, updated_at";

pub(crate) const INSTANCE_COLUMNS: &str = "id, user_id, plan_id, payment_order_id, payment_id, \
     amount, status, start_date, end_date, quota_reset_at, renewal_of, created_at, updated_at";

/// Owner of the SQLite connection
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Create or open the billing database at `path`
    pub fn open(path: &Path) -> BillingResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BillingError::Internal(format!("Failed to create database dir: {}", e))
            })?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::init(conn)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> BillingResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> BillingResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        debug!("Billing schema ready");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection, recovering from a poisoned lock
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned: PoisonError<MutexGuard<'_, Connection>>| {
            warn!("Database mutex was poisoned, recovering inner connection");
            poisoned.into_inner()
        })
    }
}

pub(crate) fn plan_from_row(row: &Row<'_>) -> rusqlite::Result<Plan> {
    Ok(Plan {
        id: row.get(0)?,
        name: row.get(1)?,
        features: row.get(2)?,
        price: row.get(3)?,
        monthly_limit: row.get(4)?,
        is_active: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

pub(crate) fn instance_from_row(row: &Row<'_>) -> rusqlite::Result<SubscriptionInstance> {
    Ok(SubscriptionInstance {
        id: row.get(0)?,
        user_id: row.get(1)?,
        plan_id: row.get(2)?,
        payment_order_id: row.get(3)?,
        payment_id: row.get(4)?,
        amount: row.get(5)?,
        status: row.get(6)?,
        start_date: row.get(7)?,
        end_date: row.get(8)?,
        quota_reset_at: row.get(9)?,
        renewal_of: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

pub(crate) fn find_plan(conn: &Connection, plan_id: i64) -> BillingResult<Option<Plan>> {
    let plan = conn
        .query_row(
            &format!("SELECT {PLAN_COLUMNS} FROM plans WHERE id = ?1"),
            params![plan_id],
            plan_from_row,
        )
        .optional()?;
    Ok(plan)
}

pub(crate) fn find_instance(
    conn: &Connection,
    instance_id: i64,
) -> BillingResult<Option<SubscriptionInstance>> {
    let instance = conn
        .query_row(
            &format!("SELECT {INSTANCE_COLUMNS} FROM user_subscriptions WHERE id = ?1"),
            params![instance_id],
            instance_from_row,
        )
        .optional()?;
    Ok(instance)
}

/// Move an instance between statuses through the transition table
///
/// The current status is part of the `WHERE` clause; returns false when the
/// row was no longer in `from` (someone else moved it first).
pub(crate) fn transition(
    tx: &Transaction<'_>,
    instance_id: i64,
    from: SubscriptionStatus,
    to: SubscriptionStatus,
    now: DateTime<Utc>,
) -> BillingResult<bool> {
    if from.is_terminal() {
        return Err(BillingError::InvalidState(format!(
            "subscription {} is {} and cannot change",
            instance_id, from
        )));
    }
    if !from.can_transition_to(to) {
        return Err(BillingError::InvalidState(format!(
            "subscription {} cannot move from {} to {}",
            instance_id, from, to
        )));
    }

    let changed = tx.execute(
        "UPDATE user_subscriptions SET status = ?1, updated_at = ?2
         WHERE id = ?3 AND status = ?4",
        params![to, now, instance_id, from],
    )?;

    debug!(instance_id, %from, %to, changed, "Subscription status transition");
    Ok(changed == 1)
}

/// Single-statement variant of [`transition`] for callers outside a transaction
pub(crate) fn transition_now(
    conn: &mut Connection,
    instance_id: i64,
    from: SubscriptionStatus,
    to: SubscriptionStatus,
    now: DateTime<Utc>,
) -> BillingResult<bool> {
    let tx = conn.transaction()?;
    let changed = transition(&tx, instance_id, from, to, now)?;
    tx.commit()?;
    Ok(changed)
}
