//! Postgres implementation of the billing store

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    GraceOverages, Plan, PlanChangeLog, PlanFeature, Subscription, UsageRecord,
};
use crate::period::PeriodWindow;
use crate::store::{DueCursor, PlanChangeLogStore, PlanStore, SubscriptionStore, UsageStore};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Create a database connection pool
pub async fn create_pool(database_url: &str, max_connections: u32) -> BillingResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Apply the embedded schema and catalog seed migrations
pub async fn run_migrations(pool: &PgPool) -> BillingResult<()> {
    MIGRATOR.run(pool).await?;
    tracing::info!("Billing migrations applied");
    Ok(())
}

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_plans(&self, rows: Vec<PlanRow>) -> BillingResult<Vec<Plan>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();

        let feature_rows: Vec<PlanFeatureRow> = sqlx::query_as(
            r#"
            SELECT id, plan_id, feature_code, limit_type, limit_value, feature_type, limit_period
            FROM plan_features
            WHERE plan_id = ANY($1)
            ORDER BY feature_code
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut features: HashMap<Uuid, Vec<PlanFeature>> = HashMap::new();
        for row in feature_rows {
            let feature = PlanFeature::try_from(row)?;
            features.entry(feature.plan_id).or_default().push(feature);
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let plan_features = features.remove(&row.id).unwrap_or_default();
                row.into_plan(plan_features)
            })
            .collect())
    }
}

const PLAN_COLUMNS: &str = "id, code, name, description, price_monthly_cents, price_yearly_cents, \
     price_currency, is_default, sort_order, is_active";

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan_id, status, current_period_start, \
     current_period_end, trial_start, trial_end, scheduled_plan_id, scheduled_change_at, \
     cancelled_at, cancel_reason, grace_overages, grace_period_end, version, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    id: Uuid,
    code: String,
    name: String,
    description: Option<String>,
    price_monthly_cents: i64,
    price_yearly_cents: Option<i64>,
    price_currency: String,
    is_default: bool,
    sort_order: i32,
    is_active: bool,
}

impl PlanRow {
    fn into_plan(self, features: Vec<PlanFeature>) -> Plan {
        Plan {
            id: self.id,
            code: self.code,
            name: self.name,
            description: self.description,
            price_monthly_cents: self.price_monthly_cents,
            price_yearly_cents: self.price_yearly_cents,
            price_currency: self.price_currency,
            is_default: self.is_default,
            sort_order: self.sort_order,
            is_active: self.is_active,
            features,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PlanFeatureRow {
    id: Uuid,
    plan_id: Uuid,
    feature_code: String,
    limit_type: String,
    limit_value: i64,
    feature_type: Option<String>,
    limit_period: Option<String>,
}

impl TryFrom<PlanFeatureRow> for PlanFeature {
    type Error = BillingError;

    fn try_from(row: PlanFeatureRow) -> Result<Self, Self::Error> {
        Ok(PlanFeature {
            id: row.id,
            plan_id: row.plan_id,
            feature_code: row.feature_code,
            limit_type: row.limit_type.parse()?,
            limit_value: row.limit_value,
            feature_type: row.feature_type.as_deref().map(str::parse).transpose()?,
            limit_period: row.limit_period.as_deref().map(str::parse).transpose()?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    plan_id: Uuid,
    status: String,
    current_period_start: OffsetDateTime,
    current_period_end: Option<OffsetDateTime>,
    trial_start: Option<OffsetDateTime>,
    trial_end: Option<OffsetDateTime>,
    scheduled_plan_id: Option<Uuid>,
    scheduled_change_at: Option<OffsetDateTime>,
    cancelled_at: Option<OffsetDateTime>,
    cancel_reason: Option<String>,
    grace_overages: Option<Json<GraceOverages>>,
    grace_period_end: Option<OffsetDateTime>,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: row.id,
            user_id: row.user_id,
            plan_id: row.plan_id,
            status: row.status.parse()?,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            trial_start: row.trial_start,
            trial_end: row.trial_end,
            scheduled_plan_id: row.scheduled_plan_id,
            scheduled_change_at: row.scheduled_change_at,
            cancelled_at: row.cancelled_at,
            cancel_reason: row.cancel_reason,
            grace_overages: row.grace_overages.map(|Json(map)| map),
            grace_period_end: row.grace_period_end,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_subscriptions(rows: Vec<SubscriptionRow>) -> BillingResult<Vec<Subscription>> {
    rows.into_iter().map(Subscription::try_from).collect()
}

#[derive(Debug, sqlx::FromRow)]
struct UsageRow {
    id: Uuid,
    user_id: Uuid,
    feature_code: String,
    period_type: String,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    count: i64,
}

impl TryFrom<UsageRow> for UsageRecord {
    type Error = BillingError;

    fn try_from(row: UsageRow) -> Result<Self, Self::Error> {
        Ok(UsageRecord {
            id: row.id,
            user_id: row.user_id,
            feature_code: row.feature_code,
            period_type: row.period_type.parse()?,
            period_start: row.period_start,
            period_end: row.period_end,
            count: row.count,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PlanChangeLogRow {
    id: Uuid,
    user_id: Uuid,
    from_plan_id: Option<Uuid>,
    to_plan_id: Option<Uuid>,
    change_type: String,
    requested_at: OffsetDateTime,
    effective_at: Option<OffsetDateTime>,
    scheduled_for: Option<OffsetDateTime>,
    proration_amount_cents: Option<i64>,
    reason: Option<String>,
    metadata: serde_json::Value,
}

impl TryFrom<PlanChangeLogRow> for PlanChangeLog {
    type Error = BillingError;

    fn try_from(row: PlanChangeLogRow) -> Result<Self, Self::Error> {
        Ok(PlanChangeLog {
            id: row.id,
            user_id: row.user_id,
            from_plan_id: row.from_plan_id,
            to_plan_id: row.to_plan_id,
            change_type: row.change_type.parse()?,
            requested_at: row.requested_at,
            effective_at: row.effective_at,
            scheduled_for: row.scheduled_for,
            proration_amount_cents: row.proration_amount_cents,
            reason: row.reason,
            metadata: row.metadata,
        })
    }
}

#[async_trait]
impl PlanStore for PgBillingStore {
    async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        let rows: Vec<PlanRow> = sqlx::query_as(&format!(
            "SELECT {} FROM plans ORDER BY sort_order, code",
            PLAN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        self.load_plans(rows).await
    }

    async fn get_plan_by_code(&self, code: &str) -> BillingResult<Option<Plan>> {
        let row: Option<PlanRow> =
            sqlx::query_as(&format!("SELECT {} FROM plans WHERE code = $1", PLAN_COLUMNS))
                .bind(code)
                .fetch_optional(&self.pool)
                .await?;
        Ok(self.load_plans(row.into_iter().collect()).await?.pop())
    }

    async fn get_plan_by_id(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        let row: Option<PlanRow> =
            sqlx::query_as(&format!("SELECT {} FROM plans WHERE id = $1", PLAN_COLUMNS))
                .bind(plan_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(self.load_plans(row.into_iter().collect()).await?.pop())
    }

    async fn get_default_plans(&self) -> BillingResult<Vec<Plan>> {
        let rows: Vec<PlanRow> = sqlx::query_as(&format!(
            "SELECT {} FROM plans WHERE is_default = true ORDER BY sort_order",
            PLAN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        self.load_plans(rows).await
    }
}

#[async_trait]
impl SubscriptionStore for PgBillingStore {
    async fn get_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO subscriptions
                (id, user_id, plan_id, status, current_period_start, current_period_end,
                 trial_start, trial_end, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, $9, $9)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.user_id)
        .bind(subscription.plan_id)
        .bind(subscription.status.as_str())
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.trial_start)
        .bind(subscription.trial_end)
        .bind(subscription.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn save_subscription(
        &self,
        subscription: &Subscription,
        log: Option<&PlanChangeLog>,
    ) -> BillingResult<Subscription> {
        let mut tx = self.pool.begin().await?;

        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions SET
                plan_id = $3,
                status = $4,
                current_period_start = $5,
                current_period_end = $6,
                trial_start = $7,
                trial_end = $8,
                scheduled_plan_id = $9,
                scheduled_change_at = $10,
                cancelled_at = $11,
                cancel_reason = $12,
                grace_overages = $13,
                grace_period_end = $14,
                version = version + 1,
                updated_at = NOW()
            WHERE user_id = $1 AND version = $2
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription.user_id)
        .bind(subscription.version)
        .bind(subscription.plan_id)
        .bind(subscription.status.as_str())
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.trial_start)
        .bind(subscription.trial_end)
        .bind(subscription.scheduled_plan_id)
        .bind(subscription.scheduled_change_at)
        .bind(subscription.cancelled_at)
        .bind(&subscription.cancel_reason)
        .bind(subscription.grace_overages.as_ref().map(Json))
        .bind(subscription.grace_period_end)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            // Optimistic lock failed - someone else modified the row
            return Err(BillingError::ConcurrentModification(format!(
                "Subscription for user {} was modified by another process. Please retry.",
                subscription.user_id
            )));
        };

        if let Some(entry) = log {
            sqlx::query(
                r#"
                INSERT INTO plan_change_logs
                    (id, user_id, from_plan_id, to_plan_id, change_type, requested_at,
                     effective_at, scheduled_for, proration_amount_cents, reason, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(entry.id)
            .bind(entry.user_id)
            .bind(entry.from_plan_id)
            .bind(entry.to_plan_id)
            .bind(entry.change_type.as_str())
            .bind(entry.requested_at)
            .bind(entry.effective_at)
            .bind(entry.scheduled_for)
            .bind(entry.proration_amount_cents)
            .bind(&entry.reason)
            .bind(&entry.metadata)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Subscription::try_from(row)
    }

    async fn list_due_scheduled_changes(
        &self,
        now: OffsetDateTime,
        after: Option<DueCursor>,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE scheduled_plan_id IS NOT NULL AND scheduled_change_at <= $1
              AND ($3::timestamptz IS NULL OR (scheduled_change_at, user_id) > ($3, $4::uuid))
            ORDER BY scheduled_change_at, user_id
            LIMIT $2
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .bind(after.map(|c| c.scheduled_change_at))
        .bind(after.map(|c| c.user_id))
        .fetch_all(&self.pool)
        .await?;
        into_subscriptions(rows)
    }

    async fn list_grace_periods_ending(
        &self,
        after: OffsetDateTime,
        until: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE grace_overages IS NOT NULL
              AND grace_period_end > $1
              AND grace_period_end <= $2
            ORDER BY grace_period_end
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(after)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;
        into_subscriptions(rows)
    }

    async fn list_expired_grace_periods(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE grace_overages IS NOT NULL AND grace_period_end <= $1
            ORDER BY grace_period_end
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        into_subscriptions(rows)
    }

    async fn list_subscriptions(
        &self,
        after_user_id: Option<Uuid>,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE ($1::uuid IS NULL OR user_id > $1)
            ORDER BY user_id
            LIMIT $2
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(after_user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        into_subscriptions(rows)
    }
}

#[async_trait]
impl UsageStore for PgBillingStore {
    async fn get_usage(
        &self,
        user_id: Uuid,
        feature_code: &str,
        period_start: OffsetDateTime,
    ) -> BillingResult<Option<UsageRecord>> {
        let row: Option<UsageRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, feature_code, period_type, period_start, period_end, count
            FROM usage_records
            WHERE user_id = $1 AND feature_code = $2 AND period_start = $3
            "#,
        )
        .bind(user_id)
        .bind(feature_code)
        .bind(period_start)
        .fetch_optional(&self.pool)
        .await?;
        row.map(UsageRecord::try_from).transpose()
    }

    async fn increment_usage(
        &self,
        user_id: Uuid,
        feature_code: &str,
        window: &PeriodWindow,
        amount: i64,
    ) -> BillingResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO usage_records
                (id, user_id, feature_code, period_type, period_start, period_end, count)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_id, feature_code, period_start)
            DO UPDATE SET count = usage_records.count + EXCLUDED.count,
                          updated_at = NOW()
            RETURNING count
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(feature_code)
        .bind(window.period.as_str())
        .bind(window.start)
        .bind(window.end)
        .bind(amount)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn decrement_usage(
        &self,
        user_id: Uuid,
        feature_code: &str,
        window: &PeriodWindow,
        amount: i64,
    ) -> BillingResult<i64> {
        let count: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE usage_records
            SET count = GREATEST(count - $4, 0),
                updated_at = NOW()
            WHERE user_id = $1 AND feature_code = $2 AND period_start = $3
            RETURNING count
            "#,
        )
        .bind(user_id)
        .bind(feature_code)
        .bind(window.start)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.unwrap_or(0))
    }

    async fn list_usage_history(
        &self,
        user_id: Uuid,
        feature_code: &str,
    ) -> BillingResult<Vec<UsageRecord>> {
        let rows: Vec<UsageRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, feature_code, period_type, period_start, period_end, count
            FROM usage_records
            WHERE user_id = $1 AND feature_code = $2
            ORDER BY period_start DESC
            "#,
        )
        .bind(user_id)
        .bind(feature_code)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(UsageRecord::try_from).collect()
    }
}

#[async_trait]
impl PlanChangeLogStore for PgBillingStore {
    async fn list_plan_changes(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<PlanChangeLog>> {
        let rows: Vec<PlanChangeLogRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, from_plan_id, to_plan_id, change_type, requested_at,
                   effective_at, scheduled_for, proration_amount_cents, reason, metadata
            FROM plan_change_logs
            WHERE user_id = $1
            ORDER BY requested_at DESC, created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(PlanChangeLog::try_from).collect()
    }
}
