//! Billing storage
//!
//! Durable records and the lookups the core needs: customers (joined with
//! their plan type so state derivation needs no second query), plans, limits,
//! and stored processor events. Concurrent units of work targeting the same
//! customer rely on the database's per-row serialization, not on anything in
//! this module.

use std::collections::HashMap;

use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use subtrack_shared::{CardSummary, EventStatus, PaymentState, PlanType};

use crate::error::{BillingError, BillingResult};

/// A customer's billing attributes. One row per account.
///
/// The raw attributes here are the billing state of record; the lifecycle
/// label is re-derived from them on every read (`crate::state::derive_state`).
#[derive(Debug, Clone)]
pub struct CustomerRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    /// External-processor customer reference, if one was ever created
    pub processor_customer_id: Option<String>,
    /// External-processor subscription reference still tracked locally
    pub subscription_id: Option<String>,
    pub payment_state: PaymentState,
    /// End of the currently paid-for period. Absent means no period has
    /// ever been established (or it was cleared).
    pub current_period_end: Option<OffsetDateTime>,
    /// Display-only card summary
    pub cc_info: Option<CardSummary>,
    pub plan_id: Uuid,
    /// Type of the customer's plan, loaded alongside the row
    pub plan_type: PlanType,
}

/// A billing plan
#[derive(Debug, Clone)]
pub struct PlanRecord {
    pub id: Uuid,
    pub name: String,
    pub plan_type: PlanType,
    /// Price displayed to users, in whole currency units
    pub display_price: i32,
    /// External-processor price reference; set iff the plan is paid
    pub price_id: Option<String>,
    pub created_at: OffsetDateTime,
}

/// A stored payment-processor event
#[derive(Debug, Clone)]
pub struct StripeEventRecord {
    pub id: Uuid,
    /// Opaque id assigned by the processor; unique at the storage layer,
    /// which is what deduplicates at-least-once deliveries
    pub event_id: String,
    pub event_type: String,
    pub payload: Value,
    pub status: EventStatus,
    /// Free-text diagnostic for inspection
    pub info: Option<String>,
    pub received_at: OffsetDateTime,
}

/// Lookups and single-record updates the billing core requires.
///
/// Implementations must serialize the read-modify-write sequence for a single
/// customer row (row locking or optimistic retry); the core only expresses
/// the intended mutation.
pub trait BillingStore {
    /// Customer for an account, auto-provisioned on the free-default plan
    /// if absent.
    async fn customer_for_user(&self, user_id: Uuid) -> BillingResult<CustomerRecord>;

    /// Customer by processor subscription reference.
    async fn customer_by_subscription(&self, subscription_id: &str)
        -> BillingResult<CustomerRecord>;

    /// Customer by processor customer reference.
    async fn customer_by_processor_id(
        &self,
        processor_customer_id: &str,
    ) -> BillingResult<CustomerRecord>;

    /// Persist a customer's billing attributes.
    async fn update_customer(&self, customer: &CustomerRecord) -> BillingResult<()>;

    async fn plan(&self, plan_id: Uuid) -> BillingResult<Option<PlanRecord>>;

    /// The system-wide free-default plan.
    async fn free_default_plan(&self) -> BillingResult<PlanRecord>;

    /// Plan-specific override for a named limit.
    async fn plan_limit(&self, plan_id: Uuid, name: &str) -> BillingResult<Option<i64>>;

    /// Global default for a named limit.
    async fn limit_default(&self, name: &str) -> BillingResult<Option<i64>>;

    /// All global limit defaults, keyed by limit name.
    async fn limit_defaults(&self) -> BillingResult<HashMap<String, i64>>;

    /// All overrides for a plan, keyed by limit name.
    async fn plan_limits(&self, plan_id: Uuid) -> BillingResult<HashMap<String, i64>>;

    /// Persist a stored event's status, info and payload.
    async fn update_event(&self, event: &StripeEventRecord) -> BillingResult<()>;
}

/// Postgres-backed billing store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

const CUSTOMER_COLUMNS: &str = r#"
    c.id,
    c.user_id,
    c.processor_customer_id,
    c.subscription_id,
    c.payment_state,
    c.current_period_end,
    c.cc_info,
    c.plan_id,
    p.type AS plan_type
"#;

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Idempotent startup initialization: create the free-default plan if it
    /// is missing. Invoked once at process startup, never lazily from read
    /// paths. The partial unique index on plan type makes a racing insert a
    /// conflict no-op rather than a second default plan.
    pub async fn ensure_free_default_plan(&self) -> BillingResult<PlanRecord> {
        sqlx::query(
            r#"
            INSERT INTO plans (id, name, type, display_price)
            VALUES ($1, 'Default (Free)', $2, 0)
            ON CONFLICT (type) WHERE type = 'free_default' DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(PlanType::FreeDefault)
        .execute(&self.pool)
        .await?;

        let plan = self.free_default_plan().await?;
        tracing::debug!(plan_id = %plan.id, "free-default plan present");
        Ok(plan)
    }

    /// Claim a batch of unprocessed events for dispatch. Uses
    /// `FOR UPDATE SKIP LOCKED` so concurrent workers never pick the same
    /// event twice.
    pub async fn claim_new_events(&self, limit: i64) -> BillingResult<Vec<StripeEventRecord>> {
        let events: Vec<StripeEventRecord> = sqlx::query_as(
            r#"
            SELECT id, event_id, type, payload, status, info, received_at
            FROM stripe_events
            WHERE status = 'new'
            ORDER BY received_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    async fn customer_where(
        &self,
        predicate: &str,
        value: &str,
    ) -> BillingResult<Option<CustomerRecord>> {
        let query = format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers c JOIN plans p ON p.id = c.plan_id WHERE {predicate}"
        );
        let customer: Option<CustomerRecord> = sqlx::query_as(&query)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(customer)
    }
}

impl BillingStore for PgStore {
    async fn customer_for_user(&self, user_id: Uuid) -> BillingResult<CustomerRecord> {
        let query = format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers c JOIN plans p ON p.id = c.plan_id WHERE c.user_id = $1"
        );
        let existing: Option<CustomerRecord> = sqlx::query_as(&query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(customer) = existing {
            return Ok(customer);
        }

        // One customer per account, provisioned on the free-default plan.
        let plan = self.free_default_plan().await?;
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO customers (id, user_id, payment_state, plan_id)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(PaymentState::Off)
        .bind(plan.id)
        .execute(&self.pool)
        .await?;

        tracing::info!(user_id = %user_id, customer_id = %id, "Provisioned billing customer");

        Ok(CustomerRecord {
            id,
            user_id,
            processor_customer_id: None,
            subscription_id: None,
            payment_state: PaymentState::Off,
            current_period_end: None,
            cc_info: None,
            plan_id: plan.id,
            plan_type: plan.plan_type,
        })
    }

    async fn customer_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<CustomerRecord> {
        self.customer_where("c.subscription_id = $1", subscription_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "No customer with subscription id {subscription_id}"
                ))
            })
    }

    async fn customer_by_processor_id(
        &self,
        processor_customer_id: &str,
    ) -> BillingResult<CustomerRecord> {
        self.customer_where("c.processor_customer_id = $1", processor_customer_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "No customer with processor customer id {processor_customer_id}"
                ))
            })
    }

    async fn update_customer(&self, customer: &CustomerRecord) -> BillingResult<()> {
        let cc_info = customer
            .cc_info
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| BillingError::Internal(format!("Failed to encode cc_info: {e}")))?;

        sqlx::query(
            r#"
            UPDATE customers
            SET processor_customer_id = $1,
                subscription_id = $2,
                payment_state = $3,
                current_period_end = $4,
                cc_info = $5,
                plan_id = $6
            WHERE id = $7
            "#,
        )
        .bind(&customer.processor_customer_id)
        .bind(&customer.subscription_id)
        .bind(customer.payment_state)
        .bind(customer.current_period_end)
        .bind(cc_info)
        .bind(customer.plan_id)
        .bind(customer.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn plan(&self, plan_id: Uuid) -> BillingResult<Option<PlanRecord>> {
        let plan: Option<PlanRecord> = sqlx::query_as(
            "SELECT id, name, type, display_price, price_id, created_at FROM plans WHERE id = $1",
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(plan)
    }

    async fn free_default_plan(&self) -> BillingResult<PlanRecord> {
        let plan: Option<PlanRecord> = sqlx::query_as(
            "SELECT id, name, type, display_price, price_id, created_at FROM plans WHERE type = $1",
        )
        .bind(PlanType::FreeDefault)
        .fetch_optional(&self.pool)
        .await?;

        plan.ok_or_else(|| {
            BillingError::Internal(
                "No free-default plan exists; startup initialization did not run".to_string(),
            )
        })
    }

    async fn plan_limit(&self, plan_id: Uuid, name: &str) -> BillingResult<Option<i64>> {
        let value: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT pl.value
            FROM plan_limits pl
            JOIN limits l ON l.id = pl.limit_id
            WHERE pl.plan_id = $1 AND l.name = $2
            "#,
        )
        .bind(plan_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value.map(|v| v.0))
    }

    async fn limit_default(&self, name: &str) -> BillingResult<Option<i64>> {
        let value: Option<(i64,)> =
            sqlx::query_as("SELECT default_value FROM limits WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.map(|v| v.0))
    }

    async fn limit_defaults(&self) -> BillingResult<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as("SELECT name, default_value FROM limits")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    async fn plan_limits(&self, plan_id: Uuid) -> BillingResult<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT l.name, pl.value
            FROM plan_limits pl
            JOIN limits l ON l.id = pl.limit_id
            WHERE pl.plan_id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn update_event(&self, event: &StripeEventRecord) -> BillingResult<()> {
        sqlx::query("UPDATE stripe_events SET status = $1, info = $2 WHERE id = $3")
            .bind(event.status)
            .bind(&event.info)
            .bind(event.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// Implement FromRow for CustomerRecord
impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for CustomerRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let cc_info: Option<Value> = row.try_get("cc_info")?;
        let cc_info = cc_info
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "cc_info".to_string(),
                source: Box::new(e),
            })?;
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            processor_customer_id: row.try_get("processor_customer_id")?,
            subscription_id: row.try_get("subscription_id")?,
            payment_state: row.try_get("payment_state")?,
            current_period_end: row.try_get("current_period_end")?,
            cc_info,
            plan_id: row.try_get("plan_id")?,
            plan_type: row.try_get("plan_type")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for PlanRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            plan_type: row.try_get("type")?,
            display_price: row.try_get("display_price")?,
            price_id: row.try_get("price_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StripeEventRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            event_type: row.try_get("type")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            info: row.try_get("info")?,
            received_at: row.try_get("received_at")?,
        })
    }
}
