//! Shared test fixtures

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::params;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::billing::{
    BillingState, Database, GatewayOrder, NewPlan, OrderRequest, PaymentGateway,
    SubscriptionStatus,
};
use crate::clock::FixedClock;
use crate::error::{BillingError, BillingResult};

pub const TEST_SECRET: &str = "test_secret";

/// 2025-01-15 10:00 UTC
pub fn fixed_clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap(),
    ))
}

pub fn new_plan(name: &str, price: i64, monthly_limit: Option<u32>) -> NewPlan {
    NewPlan {
        name: name.to_string(),
        features: format!("[\"{} interviews\"]", name),
        price,
        monthly_limit,
        is_active: true,
    }
}

pub fn insert_plan_row(db: &Database, price: i64, monthly_limit: Option<u32>) -> i64 {
    let conn = db.lock();
    let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    conn.execute(
        "INSERT INTO plans (name, features, price, monthly_limit, is_active, created_at, updated_at)
         VALUES ('Plan', '[]', ?1, ?2, 1, ?3, ?3)",
        params![price, monthly_limit, now],
    )
    .unwrap();
    conn.last_insert_rowid()
}

pub fn insert_instance_row(
    db: &Database,
    user_id: i64,
    plan_id: i64,
    status: SubscriptionStatus,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
) -> i64 {
    let conn = db.lock();
    let created = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    conn.execute(
        "INSERT INTO user_subscriptions
             (user_id, plan_id, status, start_date, end_date, quota_reset_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?4, ?6, ?6)",
        params![user_id, plan_id, status, start_date, end_date, created],
    )
    .unwrap();
    conn.last_insert_rowid()
}

type OrderHook = Box<dyn Fn() + Send + Sync>;

/// In-process gateway that records every request
#[derive(Default)]
pub struct MockGateway {
    requests: Mutex<Vec<OrderRequest>>,
    next_id: AtomicU32,
    failing: AtomicBool,
    /// Runs while an order is being created, with no store lock held
    on_create: Mutex<Option<OrderHook>>,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn on_create(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_create.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn requests(&self) -> Vec<OrderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_order(&self, request: &OrderRequest) -> BillingResult<GatewayOrder> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BillingError::Internal("gateway unavailable".to_string()));
        }

        if let Some(hook) = self.on_create.lock().unwrap().as_ref() {
            hook();
        }

        self.requests.lock().unwrap().push(request.clone());
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(GatewayOrder {
            id: format!("order_test{:04}", n),
            amount: request.amount,
            currency: request.currency.clone(),
            receipt: Some(request.receipt.clone()),
            status: Some("created".to_string()),
        })
    }
}

/// Fully wired state over an in-memory store
pub struct TestBilling {
    pub state: BillingState,
    pub db: Arc<Database>,
    pub clock: Arc<FixedClock>,
    pub gateway: Arc<MockGateway>,
}

pub fn test_billing() -> TestBilling {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let clock = fixed_clock();
    let gateway = MockGateway::new();
    let state = BillingState::with_parts(
        db.clone(),
        clock.clone(),
        gateway.clone(),
        TEST_SECRET,
        "INR",
        4,
    );
    TestBilling {
        state,
        db,
        clock,
        gateway,
    }
}

/// Signature the gateway would send for a successful payment
pub fn sign(order_id: &str, payment_id: &str) -> String {
    crate::billing::PaymentSigner::new(TEST_SECRET)
        .sign(order_id, payment_id)
        .unwrap()
}
