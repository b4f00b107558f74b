//! SQLite-backed monthly usage counters
//!
//! One row per (user, subscription instance, year, month). Rows are created on
//! first use and only ever incremented; a new month or a new instance simply
//! starts a new key, so there is no reset job.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tracing::debug;

use super::store::Database;
use super::types::MonthlyUsage;
use crate::clock::Clock;
use crate::error::BillingResult;

/// Composite counter key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageKey {
    pub user_id: i64,
    pub subscription_instance_id: i64,
    pub year: i32,
    pub month: u32,
}

/// Usage counter queries
pub struct UsageTracker {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl UsageTracker {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Key for the current calendar month
    pub fn current_key(&self, user_id: i64, subscription_instance_id: i64) -> UsageKey {
        let (year, month) = self.clock.year_month();
        UsageKey {
            user_id,
            subscription_instance_id,
            year,
            month,
        }
    }

    /// Count for this month, zero when no row exists yet
    pub fn current_count(&self, user_id: i64, subscription_instance_id: i64) -> BillingResult<u32> {
        let key = self.current_key(user_id, subscription_instance_id);
        let conn = self.db.lock();
        read_count(&conn, &key)
    }

    /// Usage history for a user, newest month first
    pub fn history(&self, user_id: i64) -> BillingResult<Vec<MonthlyUsage>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT subscription_instance_id, year, month, interview_count
             FROM user_monthly_usage
             WHERE user_id = ?1
             ORDER BY year DESC, month DESC, subscription_instance_id DESC",
        )?;

        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok(MonthlyUsage {
                    subscription_instance_id: row.get(0)?,
                    year: row.get(1)?,
                    month: row.get(2)?,
                    interview_count: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

pub(crate) fn read_count(conn: &Connection, key: &UsageKey) -> BillingResult<u32> {
    let count = conn
        .query_row(
            "SELECT interview_count FROM user_monthly_usage
             WHERE user_id = ?1 AND subscription_instance_id = ?2 AND year = ?3 AND month = ?4",
            params![key.user_id, key.subscription_instance_id, key.year, key.month],
            |row| row.get::<_, u32>(0),
        )
        .optional()?;
    Ok(count.unwrap_or(0))
}

/// Insert-or-increment in one statement; returns the new count
pub(crate) fn increment_count(
    conn: &Connection,
    key: &UsageKey,
    now: DateTime<Utc>,
) -> BillingResult<u32> {
    let count = conn.query_row(
        r#"
        INSERT INTO user_monthly_usage
            (user_id, subscription_instance_id, year, month, interview_count, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)
        ON CONFLICT(user_id, subscription_instance_id, year, month) DO UPDATE SET
            interview_count = interview_count + 1,
            updated_at = excluded.updated_at
        RETURNING interview_count
        "#,
        params![key.user_id, key.subscription_instance_id, key.year, key.month, now],
        |row| row.get::<_, u32>(0),
    )?;

    debug!(
        user = key.user_id,
        instance = key.subscription_instance_id,
        count,
        "Incremented monthly usage"
    );
    Ok(count)
}

/// Conditional insert-or-increment in one statement
///
/// Consumes one unit only while the stored count is below `limit` (`None` =
/// unlimited). Returns the new count, or `None` when the limit was already
/// reached and nothing was written.
pub(crate) fn try_consume(
    conn: &Connection,
    key: &UsageKey,
    limit: Option<u32>,
    now: DateTime<Utc>,
) -> BillingResult<Option<u32>> {
    let count = conn
        .query_row(
            r#"
            INSERT INTO user_monthly_usage
                (user_id, subscription_instance_id, year, month, interview_count, created_at, updated_at)
            SELECT ?1, ?2, ?3, ?4, 1, ?5, ?5
            WHERE ?6 IS NULL OR ?6 > 0
            ON CONFLICT(user_id, subscription_instance_id, year, month) DO UPDATE SET
                interview_count = interview_count + 1,
                updated_at = excluded.updated_at
            WHERE ?6 IS NULL OR user_monthly_usage.interview_count < ?6
            RETURNING interview_count
            "#,
            params![
                key.user_id,
                key.subscription_instance_id,
                key.year,
                key.month,
                now,
                limit
            ],
            |row| row.get::<_, u32>(0),
        )
        .optional()?;

    debug!(
        user = key.user_id,
        instance = key.subscription_instance_id,
        limit = ?limit,
        consumed = count.is_some(),
        "Quota consumption attempt"
    );
    Ok(count)
}
